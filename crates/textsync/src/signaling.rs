/// Signaling: out-of-band exchange of negotiation data before a peer link opens
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{ParticipantId, Result, RoomId};

/// What a signaling backend reports after joining a room
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Participants already in the room when we joined
    Roster { peers: Vec<ParticipantId> },

    PeerJoined { participant_id: ParticipantId },

    PeerLeft { participant_id: ParticipantId },

    /// Opaque negotiation blob from another participant
    Negotiation {
        from: ParticipantId,
        payload: serde_json::Value,
    },
}

/// Async exchange of opaque negotiation blobs between participants of a room
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Announce `local` in `room` and start receiving events
    async fn join(
        &self,
        room: &RoomId,
        local: &ParticipantId,
    ) -> Result<mpsc::UnboundedReceiver<SignalEvent>>;

    /// Deliver `payload` to participant `to`
    async fn send(&self, to: &ParticipantId, payload: serde_json::Value) -> Result<()>;

    /// Leave the current room; a no-op when not joined
    async fn leave(&self) -> Result<()>;
}

/// Frames spoken between `WsSignaling` clients and the relay server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalFrame {
    Join {
        room_id: RoomId,
        participant_id: ParticipantId,
    },

    Roster {
        peers: Vec<ParticipantId>,
    },

    PeerJoined {
        participant_id: ParticipantId,
    },

    PeerLeft {
        participant_id: ParticipantId,
    },

    Signal {
        from: ParticipantId,
        to: ParticipantId,
        payload: serde_json::Value,
    },

    Leave,

    Error {
        message: String,
    },
}

impl SignalFrame {
    /// Client-facing event for a frame received from the relay
    pub fn into_event(self) -> Option<SignalEvent> {
        match self {
            SignalFrame::Roster { peers } => Some(SignalEvent::Roster { peers }),
            SignalFrame::PeerJoined { participant_id } => {
                Some(SignalEvent::PeerJoined { participant_id })
            }
            SignalFrame::PeerLeft { participant_id } => {
                Some(SignalEvent::PeerLeft { participant_id })
            }
            SignalFrame::Signal { from, payload, .. } => {
                Some(SignalEvent::Negotiation { from, payload })
            }
            SignalFrame::Join { .. } | SignalFrame::Leave | SignalFrame::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let frame = SignalFrame::Join {
            room_id: RoomId::default(),
            participant_id: ParticipantId::from("user_a_1"),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "join");
        assert_eq!(value["room_id"], "default_room");

        let back: SignalFrame = serde_json::from_value(value).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_signal_frame_becomes_negotiation() {
        let frame = SignalFrame::Signal {
            from: ParticipantId::from("a"),
            to: ParticipantId::from("b"),
            payload: serde_json::json!({"kind": "offer"}),
        };
        assert_eq!(
            frame.into_event(),
            Some(SignalEvent::Negotiation {
                from: ParticipantId::from("a"),
                payload: serde_json::json!({"kind": "offer"}),
            })
        );
        assert_eq!(SignalFrame::Leave.into_event(), None);
    }
}
