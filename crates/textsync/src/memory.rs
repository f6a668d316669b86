/// In-process network: a signaling hub plus a connector whose links are
/// tokio channels. Used by tests and single-machine demos.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    CollabError, ConnectionState, LinkEvent, LinkOptions, ParticipantId, PeerConnector,
    PeerHandle, PeerLink, Result, RoomId, SignalEvent, Signaling,
};

type EventTx = mpsc::UnboundedSender<LinkEvent>;

/// Far end of an offered link, waiting for the remote side to accept it
struct PendingLink {
    handle: Arc<MemoryHandle>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    acceptor_events: EventTx,
    initiator_events: EventTx,
}

#[derive(Default)]
struct NetworkState {
    rooms: HashMap<RoomId, HashMap<ParticipantId, mpsc::UnboundedSender<SignalEvent>>>,

    /// Keyed by (acceptor, initiator)
    pending: HashMap<(ParticipantId, ParticipantId), PendingLink>,

    /// Participants that cannot be reached directly
    unreachable: HashSet<ParticipantId>,
}

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signaling(&self, local: ParticipantId) -> Arc<MemorySignaling> {
        Arc::new(MemorySignaling {
            network: self.clone(),
            local,
            joined: Mutex::new(None),
        })
    }

    pub fn connector(&self, local: ParticipantId) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            network: self.clone(),
            local,
        })
    }

    /// Simulate a participant behind a NAT that needs a relay
    pub fn set_unreachable(&self, participant_id: &ParticipantId, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(participant_id.clone());
        } else {
            state.unreachable.remove(participant_id);
        }
    }

    /// Number of participants currently joined to `room`
    pub fn room_size(&self, room: &RoomId) -> usize {
        self.state.lock().rooms.get(room).map_or(0, |r| r.len())
    }
}

/// Signaling through a `MemoryNetwork`
pub struct MemorySignaling {
    network: MemoryNetwork,
    local: ParticipantId,
    joined: Mutex<Option<RoomId>>,
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn join(
        &self,
        room: &RoomId,
        local: &ParticipantId,
    ) -> Result<mpsc::UnboundedReceiver<SignalEvent>> {
        if *local != self.local {
            return Err(CollabError::SignalingError(format!(
                "signaling bound to {} cannot join as {}",
                self.local, local
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.network.state.lock();
        let members = state.rooms.entry(room.clone()).or_default();

        let peers: Vec<ParticipantId> = members.keys().cloned().collect();
        let _ = tx.send(SignalEvent::Roster { peers });

        for other in members.values() {
            let _ = other.send(SignalEvent::PeerJoined {
                participant_id: local.clone(),
            });
        }
        members.insert(local.clone(), tx);
        *self.joined.lock() = Some(room.clone());

        debug!("{} joined in-memory room {}", local, room);
        Ok(rx)
    }

    async fn send(&self, to: &ParticipantId, payload: serde_json::Value) -> Result<()> {
        let room = self
            .joined
            .lock()
            .clone()
            .ok_or_else(|| CollabError::SignalingError("not joined to a room".to_string()))?;

        let state = self.network.state.lock();
        let target = state
            .rooms
            .get(&room)
            .and_then(|members| members.get(to))
            .ok_or_else(|| CollabError::SignalingError(format!("{} is not in {}", to, room)))?;

        target
            .send(SignalEvent::Negotiation {
                from: self.local.clone(),
                payload,
            })
            .map_err(|e| CollabError::SignalingError(e.to_string()))
    }

    async fn leave(&self) -> Result<()> {
        let Some(room) = self.joined.lock().take() else {
            return Ok(());
        };

        let mut state = self.network.state.lock();
        if let Some(members) = state.rooms.get_mut(&room) {
            members.remove(&self.local);
            for other in members.values() {
                let _ = other.send(SignalEvent::PeerLeft {
                    participant_id: self.local.clone(),
                });
            }
            if members.is_empty() {
                state.rooms.remove(&room);
            }
        }
        Ok(())
    }
}

/// Connector producing in-process links
pub struct MemoryConnector {
    network: MemoryNetwork,
    local: ParticipantId,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn open(
        &self,
        remote: &ParticipantId,
        options: &LinkOptions,
        signaling: Arc<dyn Signaling>,
    ) -> Result<PeerLink> {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (remote_tx, remote_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let local_handle = Arc::new(MemoryHandle {
            own_events: local_tx.clone(),
            peer_events: remote_tx.clone(),
            closed: closed.clone(),
        });
        let remote_handle = Arc::new(MemoryHandle {
            own_events: remote_tx.clone(),
            peer_events: local_tx.clone(),
            closed,
        });

        let _ = local_tx.send(LinkEvent::StateChanged(ConnectionState::Connecting));

        let key = (remote.clone(), self.local.clone());
        self.network.state.lock().pending.insert(
            key.clone(),
            PendingLink {
                handle: remote_handle,
                events: remote_rx,
                acceptor_events: remote_tx,
                initiator_events: local_tx,
            },
        );

        let offer = serde_json::json!({
            "kind": "offer",
            "label": options.channel_label,
        });
        if let Err(e) = signaling.send(remote, offer).await {
            self.network.state.lock().pending.remove(&key);
            return Err(e);
        }

        Ok(PeerLink {
            handle: local_handle,
            events: local_rx,
        })
    }

    async fn negotiate(
        &self,
        from: &ParticipantId,
        payload: serde_json::Value,
        _options: &LinkOptions,
        _signaling: Arc<dyn Signaling>,
    ) -> Result<Option<PeerLink>> {
        if payload.get("kind").and_then(|k| k.as_str()) != Some("offer") {
            debug!("ignoring negotiation blob from {}: {}", from, payload);
            return Ok(None);
        }

        let (pending, reachable) = {
            let mut state = self.network.state.lock();
            let pending = state
                .pending
                .remove(&(self.local.clone(), from.clone()))
                .ok_or_else(|| {
                    CollabError::NetworkError(format!("no pending offer from {}", from))
                })?;
            let reachable =
                !state.unreachable.contains(from) && !state.unreachable.contains(&self.local);
            (pending, reachable)
        };

        if !reachable {
            let reason = "no direct route to peer and no relay configured".to_string();
            let _ = pending
                .initiator_events
                .send(LinkEvent::ChannelErrored(reason));
            let _ = pending
                .initiator_events
                .send(LinkEvent::StateChanged(ConnectionState::Closed));
            return Ok(None);
        }

        for events in [&pending.initiator_events, &pending.acceptor_events] {
            let _ = events.send(LinkEvent::StateChanged(ConnectionState::Connected));
            let _ = events.send(LinkEvent::ChannelOpened);
        }

        Ok(Some(PeerLink {
            handle: pending.handle,
            events: pending.events,
        }))
    }
}

/// One side of an in-process link
struct MemoryHandle {
    own_events: EventTx,
    peer_events: EventTx,
    closed: Arc<AtomicBool>,
}

impl PeerHandle for MemoryHandle {
    fn send(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollabError::NetworkError("channel closed".to_string()));
        }
        self.peer_events
            .send(LinkEvent::Message(text.to_string()))
            .map_err(|_| CollabError::NetworkError("peer dropped".to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for events in [&self.own_events, &self.peer_events] {
            let _ = events.send(LinkEvent::ChannelClosed);
            let _ = events.send(LinkEvent::StateChanged(ConnectionState::Closed));
        }
    }
}
