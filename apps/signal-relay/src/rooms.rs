use std::collections::HashMap;
use std::sync::Arc;
use textsync::{ParticipantId, RoomId, SignalFrame};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};

pub type Tx = mpsc::UnboundedSender<Message>;

/// Members of every room, keyed by participant
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<RwLock<HashMap<RoomId, HashMap<ParticipantId, Tx>>>>,
}

impl Rooms {
    /// Add `participant` to `room`, send it the roster and tell the others
    pub async fn join(&self, room: &RoomId, participant: &ParticipantId, tx: Tx) -> anyhow::Result<()> {
        let mut rooms = self.inner.write().await;
        let members = rooms.entry(room.clone()).or_default();

        if members.contains_key(participant) {
            anyhow::bail!("{} is already in {}", participant, room);
        }

        let mut peers: Vec<ParticipantId> = members.keys().cloned().collect();
        peers.sort();
        send_frame(&tx, &SignalFrame::Roster { peers });

        let joined = SignalFrame::PeerJoined {
            participant_id: participant.clone(),
        };
        for other in members.values() {
            send_frame(other, &joined);
        }

        members.insert(participant.clone(), tx);
        info!("{} joined {} ({} member(s))", participant, room, members.len());
        Ok(())
    }

    /// Remove `participant` and tell the remaining members
    pub async fn leave(&self, room: &RoomId, participant: &ParticipantId) {
        let mut rooms = self.inner.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return;
        };
        if members.remove(participant).is_none() {
            return;
        }
        info!("{} left {}", participant, room);

        let left = SignalFrame::PeerLeft {
            participant_id: participant.clone(),
        };
        for other in members.values() {
            send_frame(other, &left);
        }

        if members.is_empty() {
            info!("Room {} is empty, removing", room);
            rooms.remove(room);
        }
    }

    /// Deliver a negotiation blob to `to` within `room`
    pub async fn forward(
        &self,
        room: &RoomId,
        from: &ParticipantId,
        to: &ParticipantId,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let rooms = self.inner.read().await;
        let target = rooms
            .get(room)
            .and_then(|members| members.get(to))
            .ok_or_else(|| anyhow::anyhow!("{} is not in {}", to, room))?;

        send_frame(
            target,
            &SignalFrame::Signal {
                from: from.clone(),
                to: to.clone(),
                payload,
            },
        );
        Ok(())
    }

    pub async fn member_count(&self, room: &RoomId) -> usize {
        self.inner.read().await.get(room).map_or(0, |m| m.len())
    }
}

pub fn send_frame(tx: &Tx, frame: &SignalFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => error!("Failed to serialize frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> SignalFrame {
        match rx.try_recv() {
            Ok(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_forward_leave() {
        let rooms = Rooms::default();
        let room = RoomId::default();
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();

        rooms.join(&room, &a, a_tx).await.unwrap();
        assert_eq!(next_frame(&mut a_rx), SignalFrame::Roster { peers: vec![] });

        rooms.join(&room, &b, b_tx).await.unwrap();
        assert_eq!(
            next_frame(&mut b_rx),
            SignalFrame::Roster {
                peers: vec![a.clone()]
            }
        );
        assert_eq!(
            next_frame(&mut a_rx),
            SignalFrame::PeerJoined {
                participant_id: b.clone()
            }
        );

        rooms
            .forward(&room, &b, &a, serde_json::json!({"kind": "offer"}))
            .await
            .unwrap();
        assert!(matches!(next_frame(&mut a_rx), SignalFrame::Signal { from, .. } if from == b));

        rooms.leave(&room, &b).await;
        assert_eq!(
            next_frame(&mut a_rx),
            SignalFrame::PeerLeft { participant_id: b }
        );
        assert_eq!(rooms.member_count(&room).await, 1);

        rooms.leave(&room, &a).await;
        assert_eq!(rooms.member_count(&room).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_join_and_unknown_target() {
        let rooms = Rooms::default();
        let room = RoomId::default();
        let a = ParticipantId::from("a");
        let (tx, _rx) = mpsc::unbounded_channel();

        rooms.join(&room, &a, tx.clone()).await.unwrap();
        assert!(rooms.join(&room, &a, tx).await.is_err());
        assert!(rooms
            .forward(&room, &a, &ParticipantId::from("ghost"), serde_json::Value::Null)
            .await
            .is_err());
    }
}
