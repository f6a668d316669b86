/// Wire messages carried over peer data channels
use serde::{Deserialize, Serialize};

use crate::{now_ms, DisplayColor, Operation, Participant, ParticipantId, Result, RoomId};

/// Message types exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// A local edit to replay on the remote buffer
    TextOperation { operation: Operation },

    /// Sender's cursor offset; null when unknown
    CursorPosition { position: Option<usize> },

    /// Unconditional replacement of the whole buffer
    FullTextSync { text: String },

    RoomChange {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },

    Heartbeat,
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::TextOperation { .. } => "text_operation",
            SyncMessage::CursorPosition { .. } => "cursor_position",
            SyncMessage::FullTextSync { .. } => "full_text_sync",
            SyncMessage::RoomChange { .. } => "room_change",
            SyncMessage::Heartbeat => "heartbeat",
        }
    }
}

/// Common envelope: sender identity and send time around a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub participant_id: ParticipantId,

    pub display_color: DisplayColor,

    pub timestamp_ms: i64,

    /// Room the sender is in; absent for senders that do not scope by room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,

    #[serde(flatten)]
    pub message: SyncMessage,
}

impl Envelope {
    /// Stamp `message` with the sender's identity and the current time
    pub fn new(sender: &Participant, room_id: &RoomId, message: SyncMessage) -> Self {
        Self {
            participant_id: sender.id.clone(),
            display_color: sender.color.clone(),
            timestamp_ms: now_ms(),
            room: Some(room_id.clone()),
            message,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Whether this envelope belongs to `room`
    pub fn is_for_room(&self, room: &RoomId) -> bool {
        self.room.as_ref().map_or(true, |r| r == room)
    }
}

/// An envelope as delivered to message subscribers
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Peer whose channel carried the message
    pub peer_id: ParticipantId,

    pub received_at_ms: i64,

    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> Participant {
        Participant {
            id: ParticipantId::from("user_abc_1"),
            color: DisplayColor::from("#FF6B6B"),
        }
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope::new(
            &sender(),
            &RoomId::default(),
            SyncMessage::TextOperation {
                operation: Operation::insert(3, "x"),
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "text_operation");
        assert_eq!(value["participantId"], "user_abc_1");
        assert_eq!(value["displayColor"], "#FF6B6B");
        assert_eq!(value["room"], "default_room");
        assert!(value.get("roomId").is_none());
        assert!(value["timestampMs"].is_i64());
        assert_eq!(
            value["operation"],
            json!({"kind": "insert", "position": 3, "content": "x"})
        );
    }

    #[test]
    fn test_null_cursor_and_heartbeat() {
        let raw = r##"{"type":"cursor_position","participantId":"p","displayColor":"#4ECDC4","timestampMs":5,"position":null}"##;
        let envelope = Envelope::from_json(raw).unwrap();
        assert_eq!(
            envelope.message,
            SyncMessage::CursorPosition { position: None }
        );
        assert_eq!(envelope.room, None);

        let raw = r##"{"type":"heartbeat","participantId":"p","displayColor":"#4ECDC4","timestampMs":5}"##;
        let envelope = Envelope::from_json(raw).unwrap();
        assert_eq!(envelope.message, SyncMessage::Heartbeat);
    }

    #[test]
    fn test_room_change_field_name() {
        let envelope = Envelope::new(
            &sender(),
            &RoomId::from("a"),
            SyncMessage::RoomChange {
                room_id: RoomId::from("b"),
            },
        );
        let json = envelope.to_json().unwrap();
        let back = Envelope::from_json(&json).unwrap();
        assert_eq!(back.room, Some(RoomId::from("a")));
        assert_eq!(
            back.message,
            SyncMessage::RoomChange {
                room_id: RoomId::from("b")
            }
        );
    }

    #[test]
    fn test_room_filter() {
        let mut envelope = Envelope::new(&sender(), &RoomId::from("a"), SyncMessage::Heartbeat);
        assert!(envelope.is_for_room(&RoomId::from("a")));
        assert!(!envelope.is_for_room(&RoomId::from("b")));

        envelope.room = None;
        assert!(envelope.is_for_room(&RoomId::from("b")));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(Envelope::from_json("{not json").is_err());
        assert!(Envelope::from_json(r#"{"type":"unknown","participantId":"p","displayColor":"c","timestampMs":1}"#).is_err());
    }
}
