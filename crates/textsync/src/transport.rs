/// Peer transport: one link per remote participant, JSON envelopes on top
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    now_ms, ChannelState, CollabConfig, ConnectionState, Envelope, InboundMessage, LinkEvent,
    LinkOptions, LinkRole, Participant, ParticipantId, PeerConnector, PeerHandle, PeerLink,
    Result, RoomId, SignalEvent, Signaling, StatusView, SyncMessage,
};

/// Overall transport status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    Offline,
    Discovering,
    Connected,
}

/// A peer's channel opened or went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub peer_id: ParticipantId,
    pub connected: bool,
    pub role: LinkRole,
}

/// Snapshot of one entry in the peer map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub transport_state: ConnectionState,
    pub channel_state: ChannelState,
    pub role: LinkRole,
}

pub type ConnectionCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

struct PeerEntry {
    handle: Arc<dyn PeerHandle>,
    role: LinkRole,
    transport_state: ConnectionState,
    channel_state: ChannelState,

    /// Distinguishes a replaced link from its successor
    link_id: u64,
}

struct TransportInner {
    room: RoomId,
    peers: HashMap<ParticipantId, PeerEntry>,
    status: TransportStatus,
    status_text: String,
    signal_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl TransportInner {
    fn open_peer_count(&self) -> usize {
        self.peers
            .values()
            .filter(|e| e.channel_state == ChannelState::Open)
            .count()
    }
}

/// Manages peer links for the local participant
pub struct PeerTransport {
    participant: Participant,
    options: LinkOptions,
    heartbeat_interval: Duration,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn Signaling>,
    inner: Mutex<TransportInner>,
    connection_callbacks: Mutex<Vec<ConnectionCallback>>,
    message_callbacks: Mutex<Vec<MessageCallback>>,
    status_view: Mutex<Option<Arc<dyn StatusView>>>,
    next_link_id: AtomicU64,
    me: Weak<PeerTransport>,
}

impl PeerTransport {
    pub fn new(
        participant: Participant,
        config: &CollabConfig,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn Signaling>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            participant,
            options: LinkOptions {
                ice_servers: config.ice_servers.clone(),
                channel_label: config.channel_label.clone(),
            },
            heartbeat_interval: config.heartbeat_interval(),
            connector,
            signaling,
            inner: Mutex::new(TransportInner {
                room: config.room_id.clone(),
                peers: HashMap::new(),
                status: TransportStatus::Offline,
                status_text: "Disconnected".to_string(),
                signal_task: None,
                heartbeat_task: None,
            }),
            connection_callbacks: Mutex::new(Vec::new()),
            message_callbacks: Mutex::new(Vec::new()),
            status_view: Mutex::new(None),
            next_link_id: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn room(&self) -> RoomId {
        self.inner.lock().room.clone()
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.lock().status
    }

    pub fn status_text(&self) -> String {
        self.inner.lock().status_text.clone()
    }

    /// Whether at least one channel is open
    pub fn is_connected(&self) -> bool {
        self.inner.lock().open_peer_count() > 0
    }

    /// Connected peers plus the local participant
    pub fn participant_count(&self) -> usize {
        self.inner.lock().open_peer_count() + 1
    }

    /// Peers whose channel is open, sorted
    pub fn connected_peers(&self) -> Vec<ParticipantId> {
        let mut peers: Vec<ParticipantId> = self
            .inner
            .lock()
            .peers
            .iter()
            .filter(|(_, e)| e.channel_state == ChannelState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn peer_info(&self, peer_id: &ParticipantId) -> Option<PeerInfo> {
        self.inner.lock().peers.get(peer_id).map(|e| PeerInfo {
            transport_state: e.transport_state,
            channel_state: e.channel_state,
            role: e.role,
        })
    }

    /// Number of live or pending links
    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn on_connection_change(&self, callback: ConnectionCallback) {
        self.connection_callbacks.lock().push(callback);
    }

    pub fn on_message(&self, callback: MessageCallback) {
        self.message_callbacks.lock().push(callback);
    }

    /// Push status and participant count to `view` from now on
    pub fn set_status_view(&self, view: Arc<dyn StatusView>) {
        let (text, count) = {
            let inner = self.inner.lock();
            (inner.status_text.clone(), inner.open_peer_count() + 1)
        };
        view.show_status(&text);
        view.show_participant_count(count);
        *self.status_view.lock() = Some(view);
    }

    /// Join the current room through signaling and link up with its members
    pub async fn discover_peers(&self) -> Result<()> {
        self.set_status(TransportStatus::Discovering, "Looking for peers...");

        let room = self.room();
        let mut events = match self.signaling.join(&room, &self.participant.id).await {
            Ok(events) => events,
            Err(e) => {
                self.set_status(TransportStatus::Offline, "Disconnected");
                return Err(e);
            }
        };
        info!("{} discovering peers in {}", self.participant.id, room);

        let me = self.me.clone();
        let signal_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(transport) = me.upgrade() else {
                    break;
                };
                transport.on_signal_event(event).await;
            }
            debug!("Signaling event stream ended");
        });

        let heartbeat_task = self.spawn_heartbeat();

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.signal_task.replace(signal_task) {
            previous.abort();
        }
        if let Some(previous) = inner.heartbeat_task.replace(heartbeat_task) {
            previous.abort();
        }
        Ok(())
    }

    async fn on_signal_event(&self, event: SignalEvent) {
        match event {
            SignalEvent::Roster { peers } => {
                debug!("Roster has {} peer(s)", peers.len());
                for peer_id in peers {
                    if let Err(e) = self.open_connection(&peer_id).await {
                        warn!("Failed to open connection to {}: {}", peer_id, e);
                    }
                }
            }
            SignalEvent::PeerJoined { participant_id } => {
                debug!("{} joined the room", participant_id);
            }
            SignalEvent::PeerLeft { participant_id } => {
                debug!("{} left the room", participant_id);
                self.drop_peer(&participant_id);
            }
            SignalEvent::Negotiation { from, payload } => {
                let accepted = self
                    .connector
                    .negotiate(&from, payload, &self.options, self.signaling.clone())
                    .await;
                match accepted {
                    Ok(Some(link)) => self.register_link(from, LinkRole::Acceptor, link),
                    Ok(None) => {}
                    Err(e) => warn!("Negotiation with {} failed: {}", from, e),
                }
            }
        }
    }

    /// Open a link towards `peer_id`; a known peer is left alone
    pub async fn open_connection(&self, peer_id: &ParticipantId) -> Result<()> {
        if *peer_id == self.participant.id {
            return Ok(());
        }
        if self.inner.lock().peers.contains_key(peer_id) {
            debug!("Already linked to {}", peer_id);
            return Ok(());
        }

        let link = self
            .connector
            .open(peer_id, &self.options, self.signaling.clone())
            .await?;
        self.register_link(peer_id.clone(), LinkRole::Initiator, link);
        Ok(())
    }

    fn register_link(&self, peer_id: ParticipantId, role: LinkRole, link: PeerLink) {
        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        let PeerLink { handle, mut events } = link;

        let previous = self.inner.lock().peers.insert(
            peer_id.clone(),
            PeerEntry {
                handle,
                role,
                transport_state: ConnectionState::Connecting,
                channel_state: ChannelState::Opening,
                link_id,
            },
        );
        if let Some(previous) = previous {
            debug!("Replacing link to {}", peer_id);
            previous.handle.close();
        }

        let me = self.me.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(transport) = me.upgrade() else {
                    break;
                };
                if transport.on_link_event(&peer_id, link_id, event) {
                    break;
                }
            }
        });
    }

    /// Returns true once the link is finished
    fn on_link_event(&self, peer_id: &ParticipantId, link_id: u64, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Message(text) => {
                self.handle_raw(peer_id, &text);
                false
            }
            LinkEvent::ChannelOpened => {
                let role = {
                    let mut inner = self.inner.lock();
                    match inner.peers.get_mut(peer_id) {
                        Some(entry) if entry.link_id == link_id => {
                            entry.channel_state = ChannelState::Open;
                            entry.transport_state = ConnectionState::Connected;
                            entry.role
                        }
                        _ => return true,
                    }
                };
                info!("Data channel opened with {}", peer_id);
                self.refresh_status();
                self.notify_connection(&ConnectionEvent {
                    peer_id: peer_id.clone(),
                    connected: true,
                    role,
                });
                false
            }
            LinkEvent::StateChanged(state) if state.is_live() => {
                let mut inner = self.inner.lock();
                match inner.peers.get_mut(peer_id) {
                    Some(entry) if entry.link_id == link_id => {
                        entry.transport_state = state;
                        false
                    }
                    _ => true,
                }
            }
            LinkEvent::StateChanged(state) => {
                debug!("Connection with {} is {:?}", peer_id, state);
                self.remove_link(peer_id, Some(link_id));
                true
            }
            LinkEvent::ChannelClosed => {
                info!("Data channel closed with {}", peer_id);
                self.remove_link(peer_id, Some(link_id));
                true
            }
            LinkEvent::ChannelErrored(reason) => {
                warn!("Data channel error with {}: {}", peer_id, reason);
                self.remove_link(peer_id, Some(link_id));
                true
            }
        }
    }

    fn drop_peer(&self, peer_id: &ParticipantId) {
        self.remove_link(peer_id, None);
    }

    /// Remove the entry for `peer_id` if it still belongs to `link_id`
    fn remove_link(&self, peer_id: &ParticipantId, link_id: Option<u64>) {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.peers.get(peer_id) {
                Some(entry) if link_id.map_or(true, |id| id == entry.link_id) => {
                    inner.peers.remove(peer_id)
                }
                _ => None,
            }
        };

        if let Some(entry) = removed {
            entry.handle.close();
            self.refresh_status();
            self.notify_connection(&ConnectionEvent {
                peer_id: peer_id.clone(),
                connected: false,
                role: entry.role,
            });
        }
    }

    fn handle_raw(&self, peer_id: &ParticipantId, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message from {}: {}", peer_id, e);
                return;
            }
        };

        let room = self.room();
        if !envelope.is_for_room(&room) {
            debug!(
                "Dropping {} from {} for another room",
                envelope.message.kind(),
                peer_id
            );
            return;
        }

        self.notify_message(&InboundMessage {
            peer_id: peer_id.clone(),
            received_at_ms: now_ms(),
            envelope,
        });
    }

    fn encode(&self, room: &RoomId, message: SyncMessage) -> Result<String> {
        Envelope::new(&self.participant, room, message).to_json()
    }

    fn deliver(&self, peer_id: &ParticipantId, handle: &Arc<dyn PeerHandle>, json: &str) -> bool {
        match handle.send(json) {
            Ok(()) => true,
            Err(e) => {
                debug!("Skipping {}: {}", peer_id, e);
                false
            }
        }
    }

    fn open_handles(&self) -> Vec<(ParticipantId, Arc<dyn PeerHandle>)> {
        self.inner
            .lock()
            .peers
            .iter()
            .filter(|(_, e)| e.channel_state == ChannelState::Open)
            .map(|(id, e)| (id.clone(), e.handle.clone()))
            .collect()
    }

    /// Send to one peer; returns 1 when delivered to an open channel
    pub fn send(&self, peer_id: &ParticipantId, message: SyncMessage) -> Result<usize> {
        let json = self.encode(&self.room(), message)?;
        let handle = self
            .inner
            .lock()
            .peers
            .get(peer_id)
            .filter(|e| e.channel_state == ChannelState::Open)
            .map(|e| e.handle.clone());

        Ok(match handle {
            Some(handle) => usize::from(self.deliver(peer_id, &handle, &json)),
            None => 0,
        })
    }

    /// Send to every open channel; returns the number of recipients
    pub fn broadcast(&self, message: SyncMessage) -> Result<usize> {
        let json = self.encode(&self.room(), message)?;
        Ok(self.broadcast_json(&json))
    }

    fn broadcast_json(&self, json: &str) -> usize {
        self.open_handles()
            .iter()
            .filter(|(peer_id, handle)| self.deliver(peer_id, handle, json))
            .count()
    }

    /// Switch rooms; `None` selects the default room.
    ///
    /// Peers are told through a `room_change` stamped with the room being
    /// left. When discovery is running, the old links are closed and the
    /// transport re-joins signaling in the new room. Returns the number of
    /// peers notified.
    pub async fn set_room_id(&self, room: Option<RoomId>) -> Result<usize> {
        let room = room.unwrap_or_default();
        let previous = self.room();
        let json = self.encode(
            &previous,
            SyncMessage::RoomChange {
                room_id: room.clone(),
            },
        )?;
        let notified = self.broadcast_json(&json);

        let discovering = {
            let mut inner = self.inner.lock();
            inner.room = room.clone();
            inner.signal_task.is_some()
        };
        info!("Room changed from {} to {}", previous, room);

        if discovering {
            let entries = self.leave_room().await;
            self.notify_closed(entries);
            self.discover_peers().await?;
        }
        Ok(notified)
    }

    /// Close every link and leave the signaling room
    pub async fn disconnect(&self) {
        let entries = self.leave_room().await;
        self.set_status(TransportStatus::Offline, "Disconnected");
        self.notify_closed(entries);
    }

    /// Stop discovery, close all links and leave signaling; returns the
    /// dropped entries so callers can announce them
    async fn leave_room(&self) -> Vec<(ParticipantId, PeerEntry)> {
        let (entries, tasks) = {
            let mut inner = self.inner.lock();
            let entries: Vec<(ParticipantId, PeerEntry)> = inner.peers.drain().collect();
            let tasks = [inner.signal_task.take(), inner.heartbeat_task.take()];
            (entries, tasks)
        };

        for task in tasks.into_iter().flatten() {
            task.abort();
        }
        for (_, entry) in &entries {
            entry.handle.close();
        }

        if let Err(e) = self.signaling.leave().await {
            warn!("Failed to leave signaling room: {}", e);
        }
        entries
    }

    fn notify_closed(&self, entries: Vec<(ParticipantId, PeerEntry)>) {
        for (peer_id, entry) in entries {
            self.notify_connection(&ConnectionEvent {
                peer_id,
                connected: false,
                role: entry.role,
            });
        }
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let me = self.me.clone();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(transport) = me.upgrade() else {
                    break;
                };
                if !transport.is_connected() {
                    continue;
                }
                match transport.broadcast(SyncMessage::Heartbeat) {
                    Ok(count) => debug!("Heartbeat sent to {} peer(s)", count),
                    Err(e) => warn!("Heartbeat failed: {}", e),
                }
            }
        })
    }

    fn set_status(&self, status: TransportStatus, text: &str) {
        let count = {
            let mut inner = self.inner.lock();
            inner.status = status;
            inner.status_text = text.to_string();
            inner.open_peer_count() + 1
        };
        self.push_status(text, count);
    }

    fn refresh_status(&self) {
        let (text, count) = {
            let mut inner = self.inner.lock();
            let open = inner.open_peer_count();
            if open > 0 {
                inner.status = TransportStatus::Connected;
                inner.status_text = format!("Connected to {} peer(s)", open);
            } else if inner.status == TransportStatus::Connected {
                inner.status = TransportStatus::Discovering;
                inner.status_text = "Looking for peers...".to_string();
            }
            (inner.status_text.clone(), open + 1)
        };
        self.push_status(&text, count);
    }

    fn push_status(&self, text: &str, count: usize) {
        let view = self.status_view.lock().clone();
        if let Some(view) = view {
            view.show_status(text);
            view.show_participant_count(count);
        }
    }

    fn notify_connection(&self, event: &ConnectionEvent) {
        let callbacks = self.connection_callbacks.lock().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Connection callback panicked for {}", event.peer_id);
            }
        }
    }

    fn notify_message(&self, message: &InboundMessage) {
        let callbacks = self.message_callbacks.lock().clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                error!(
                    "Message callback panicked on {} from {}",
                    message.envelope.message.kind(),
                    message.peer_id
                );
            }
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for task in [inner.signal_task.take(), inner.heartbeat_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        for entry in inner.peers.values() {
            entry.handle.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DisplayColor, HeadlessSurface, MemoryNetwork};

    fn participant(id: &str) -> Participant {
        Participant {
            id: ParticipantId::from(id),
            color: DisplayColor::from("#96CEB4"),
        }
    }

    fn transport(network: &MemoryNetwork, id: &str) -> Arc<PeerTransport> {
        let me = participant(id);
        PeerTransport::new(
            me.clone(),
            &CollabConfig::default(),
            network.connector(me.id.clone()),
            network.signaling(me.id),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_broadcast_without_peers() {
        let network = MemoryNetwork::new();
        let a = transport(&network, "a");
        assert_eq!(a.broadcast(SyncMessage::Heartbeat).unwrap(), 0);
        assert_eq!(a.participant_count(), 1);
        assert_eq!(a.status(), TransportStatus::Offline);
    }

    #[tokio::test]
    async fn test_two_peers_connect() {
        let network = MemoryNetwork::new();
        let a = transport(&network, "a");
        let b = transport(&network, "b");
        let surface = Arc::new(HeadlessSurface::new());
        b.set_status_view(surface.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        b.on_connection_change(Arc::new(move |e: &ConnectionEvent| sink.lock().push(e.clone())));

        a.discover_peers().await.unwrap();
        assert_eq!(a.status_text(), "Looking for peers...");
        b.discover_peers().await.unwrap();

        wait_until(|| a.is_connected() && b.is_connected()).await;

        assert_eq!(a.peer_info(&ParticipantId::from("b")).unwrap().role, LinkRole::Acceptor);
        assert_eq!(b.peer_info(&ParticipantId::from("a")).unwrap().role, LinkRole::Initiator);
        assert_eq!(b.status_text(), "Connected to 1 peer(s)");
        assert_eq!(surface.participant_count(), 2);
        assert!(events.lock()[0].connected);

        assert_eq!(a.broadcast(SyncMessage::Heartbeat).unwrap(), 1);

        b.disconnect().await;
        b.disconnect().await;
        assert_eq!(b.status(), TransportStatus::Offline);
        assert_eq!(b.peer_count(), 0);
        assert!(!events.lock().last().unwrap().connected);

        wait_until(|| a.peer_count() == 0).await;
        assert_eq!(a.participant_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_only_while_connected() {
        let network = MemoryNetwork::new();
        let a = transport(&network, "a");
        let b = transport(&network, "b");

        let heartbeats = Arc::new(Mutex::new(0));
        let sink = heartbeats.clone();
        b.on_message(Arc::new(move |m: &InboundMessage| {
            let from_a = m.envelope.participant_id.as_str() == "a";
            if from_a && m.envelope.message == SyncMessage::Heartbeat {
                *sink.lock() += 1;
            }
        }));

        a.discover_peers().await.unwrap();
        b.discover_peers().await.unwrap();
        wait_until(|| a.is_connected() && b.is_connected()).await;

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(*heartbeats.lock(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*heartbeats.lock(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*heartbeats.lock(), 2);

        a.disconnect().await;
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(*heartbeats.lock(), 2);
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_room_dropped() {
        let network = MemoryNetwork::new();
        let a = transport(&network, "a");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        a.on_message(Arc::new(move |m: &InboundMessage| {
            sink.lock().push(m.envelope.message.clone())
        }));

        let peer = ParticipantId::from("b");
        a.handle_raw(&peer, "{not json");

        let foreign = Envelope::new(&participant("b"), &RoomId::from("elsewhere"), SyncMessage::Heartbeat);
        a.handle_raw(&peer, &foreign.to_json().unwrap());

        let local = Envelope::new(&participant("b"), &RoomId::default(), SyncMessage::Heartbeat);
        a.handle_raw(&peer, &local.to_json().unwrap());

        assert_eq!(*received.lock(), vec![SyncMessage::Heartbeat]);
    }

    #[tokio::test]
    async fn test_panicking_callback_isolated() {
        let network = MemoryNetwork::new();
        let a = transport(&network, "a");
        let count = Arc::new(Mutex::new(0));

        a.on_message(Arc::new(|_: &InboundMessage| panic!("subscriber bug")));
        let sink = count.clone();
        a.on_message(Arc::new(move |_: &InboundMessage| *sink.lock() += 1));

        let envelope = Envelope::new(&participant("b"), &RoomId::default(), SyncMessage::Heartbeat);
        a.handle_raw(&ParticipantId::from("b"), &envelope.to_json().unwrap());
        a.handle_raw(&ParticipantId::from("b"), &envelope.to_json().unwrap());

        assert_eq!(*count.lock(), 2);
    }

    #[tokio::test]
    async fn test_set_room_id_defaults() {
        let network = MemoryNetwork::new();
        let a = transport(&network, "a");
        a.set_room_id(Some(RoomId::from("team"))).await.unwrap();
        assert_eq!(a.room(), RoomId::from("team"));
        assert_eq!(a.status(), TransportStatus::Offline);
        a.set_room_id(None).await.unwrap();
        assert_eq!(a.room(), RoomId::default());
    }

    #[tokio::test]
    async fn test_room_switch_relinks_in_new_room() {
        let network = MemoryNetwork::new();
        let a = transport(&network, "a");
        let b = transport(&network, "b");
        let c = transport(&network, "c");
        let elsewhere = RoomId::from("elsewhere");

        let room_changes = Arc::new(Mutex::new(Vec::new()));
        let sink = room_changes.clone();
        a.on_message(Arc::new(move |m: &InboundMessage| {
            if let SyncMessage::RoomChange { room_id } = &m.envelope.message {
                sink.lock().push(room_id.clone());
            }
        }));

        a.discover_peers().await.unwrap();
        b.discover_peers().await.unwrap();
        wait_until(|| a.is_connected() && b.is_connected()).await;

        assert_eq!(b.set_room_id(Some(elsewhere.clone())).await.unwrap(), 1);
        assert_eq!(b.room(), elsewhere);
        assert_eq!(network.room_size(&elsewhere), 1);
        assert_eq!(network.room_size(&RoomId::default()), 1);

        c.set_room_id(Some(elsewhere.clone())).await.unwrap();
        c.discover_peers().await.unwrap();
        wait_until(|| b.is_connected() && c.is_connected()).await;
        wait_until(|| a.peer_count() == 0).await;

        assert_eq!(b.connected_peers(), vec![ParticipantId::from("c")]);
        assert_eq!(network.room_size(&elsewhere), 2);
        assert_eq!(*room_changes.lock(), vec![elsewhere]);
    }
}
