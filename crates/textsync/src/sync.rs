/// Sync engine: keeps the shared buffer, the text surface and remote peers in step
/// Local edits become diff operations; remote operations are spliced back in
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::Cell;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    diff_with, now_ms, utf16_len, BufferSnapshot, CollabConfig, CollabError, ConnectionEvent,
    CursorIndicator, CursorTracker, Debouncer, InboundMessage, KeyValueStore, LinkRole,
    Operation, ParticipantId, PeerTransport, Result, SyncMessage, SyncOnConnect, TextSurface,
};

/// The text every participant edits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedBuffer {
    pub text: String,
    pub last_modified_at_ms: i64,
    pub last_modified_by: ParticipantId,
}

struct EngineState {
    buffer: SharedBuffer,

    /// Text as last announced to peers; local diffs are taken against it
    baseline: String,

    /// Caret offset last seen on the surface
    last_cursor: Option<usize>,

    cursors: CursorTracker,
}

enum PersistJob {
    Save(BufferSnapshot),
    Flush(oneshot::Sender<()>),
}

/// Serializes every change to buffer and surface across threads.
///
/// The cell marks the owning thread as mid-change, so surface callbacks
/// fired by our own `set_content` are recognised as echoes.
struct ApplyLock(ReentrantMutex<Cell<bool>>);

impl ApplyLock {
    fn new() -> Self {
        Self(ReentrantMutex::new(Cell::new(false)))
    }

    /// Blocks while another thread applies; `None` when this thread already is
    fn enter(&self) -> Option<ApplyGuard<'_>> {
        let guard = self.0.lock();
        if guard.get() {
            return None;
        }
        guard.set(true);
        Some(ApplyGuard(guard))
    }

    fn is_held(&self) -> bool {
        self.0.is_locked()
    }
}

/// Clears the mark on every exit path, then releases the lock
struct ApplyGuard<'a>(ReentrantMutexGuard<'a, Cell<bool>>);

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct SyncEngine {
    transport: Arc<PeerTransport>,
    store: Arc<dyn KeyValueStore>,
    surface: Arc<dyn TextSurface>,
    config: CollabConfig,
    state: Mutex<EngineState>,
    apply_lock: ApplyLock,
    text_debouncer: Debouncer<()>,
    cursor_debouncer: Debouncer<Option<usize>>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
}

impl SyncEngine {
    /// Build the engine and subscribe it to `transport`.
    ///
    /// Spawns the debounce timers and the persistence writer, so it must be
    /// called inside a tokio runtime.
    pub fn new(
        transport: Arc<PeerTransport>,
        store: Arc<dyn KeyValueStore>,
        surface: Arc<dyn TextSurface>,
        config: CollabConfig,
    ) -> Arc<Self> {
        let persist_tx = spawn_writer(store.clone(), config.storage_key.clone());
        let local = transport.participant().id.clone();

        let engine = Arc::new_cyclic(|me: &Weak<SyncEngine>| {
            let weak = me.clone();
            let text_debouncer = Debouncer::new(config.text_debounce(), move |()| {
                if let Some(engine) = weak.upgrade() {
                    engine.flush_local_edit();
                }
            });

            let weak = me.clone();
            let cursor_debouncer = Debouncer::new(config.cursor_debounce(), move |position| {
                if let Some(engine) = weak.upgrade() {
                    engine.announce_cursor(position);
                }
            });

            Self {
                transport,
                store,
                surface,
                config,
                state: Mutex::new(EngineState {
                    buffer: SharedBuffer {
                        text: String::new(),
                        last_modified_at_ms: now_ms(),
                        last_modified_by: local,
                    },
                    baseline: String::new(),
                    last_cursor: None,
                    cursors: CursorTracker::new(),
                }),
                apply_lock: ApplyLock::new(),
                text_debouncer,
                cursor_debouncer,
                persist_tx,
            }
        });

        engine.attach();
        engine
    }

    fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.transport
            .on_message(Arc::new(move |message: &InboundMessage| {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_incoming_message(message);
                }
            }));

        let weak = Arc::downgrade(self);
        self.transport
            .on_connection_change(Arc::new(move |event: &ConnectionEvent| {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_connection_change(event);
                }
            }));
    }

    pub fn transport(&self) -> &Arc<PeerTransport> {
        &self.transport
    }

    fn local_id(&self) -> &ParticipantId {
        &self.transport.participant().id
    }

    pub fn text(&self) -> String {
        self.state.lock().buffer.text.clone()
    }

    pub fn buffer(&self) -> SharedBuffer {
        self.state.lock().buffer.clone()
    }

    /// Whether a change is being applied right now
    pub fn is_applying(&self) -> bool {
        self.apply_lock.is_held()
    }

    /// Seed buffer and surface from the persisted snapshot; false when none exists
    pub async fn load_from_storage(&self) -> Result<bool> {
        let key = &self.config.storage_key;
        let Some(snapshot) = BufferSnapshot::load(self.store.as_ref(), key).await? else {
            debug!("No stored buffer under {}", key);
            return Ok(false);
        };

        self.install_snapshot(snapshot)?;
        Ok(true)
    }

    fn install_snapshot(&self, snapshot: BufferSnapshot) -> Result<()> {
        let _guard = self.apply_lock.enter().ok_or(CollabError::ApplyInProgress)?;
        let length = utf16_len(&snapshot.text);
        {
            let mut state = self.state.lock();
            state.baseline = snapshot.text.clone();
            state.buffer = SharedBuffer {
                text: snapshot.text.clone(),
                last_modified_at_ms: snapshot.last_modified,
                last_modified_by: snapshot.user_id,
            };
        }
        self.surface.set_content(&snapshot.text);
        info!("Loaded {} characters from storage", length);
        Ok(())
    }

    /// Splice `operation` into the buffer and the surface
    pub fn apply_operation(&self, operation: &Operation, author: &ParticipantId) -> Result<()> {
        let _guard = self.apply_lock.enter().ok_or(CollabError::ApplyInProgress)?;
        let cursor = self.surface.cursor();

        let (text, snapshot) = {
            let mut state = self.state.lock();
            let text = operation.apply_to(&state.buffer.text)?;

            // Keep unannounced local edits out of the next diff
            state.baseline = match operation.apply_to(&state.baseline) {
                Ok(baseline) => baseline,
                Err(e) => {
                    debug!("Baseline out of step ({}), resetting", e);
                    text.clone()
                }
            };
            state.buffer = SharedBuffer {
                text: text.clone(),
                last_modified_at_ms: now_ms(),
                last_modified_by: author.clone(),
            };
            (text, self.snapshot(&state))
        };

        self.surface.set_content(&text);
        if let Some(cursor) = cursor {
            let moved = operation.transform_cursor(cursor).min(utf16_len(&text));
            self.surface.set_cursor(moved);
            self.state.lock().last_cursor = Some(moved);
        }
        self.persist(snapshot);
        self.render_remote_cursors();
        Ok(())
    }

    /// Replace the whole buffer; false when called from inside another change
    pub fn handle_full_text_sync(&self, text: &str, author: &ParticipantId) -> bool {
        let Some(_guard) = self.apply_lock.enter() else {
            debug!("Skipping full text sync echoed from a change in progress");
            return false;
        };
        let cursor = self.surface.cursor();

        let snapshot = {
            let mut state = self.state.lock();
            state.baseline = text.to_string();
            state.buffer = SharedBuffer {
                text: text.to_string(),
                last_modified_at_ms: now_ms(),
                last_modified_by: author.clone(),
            };
            self.snapshot(&state)
        };

        self.surface.set_content(text);
        if let Some(cursor) = cursor {
            let restored = cursor.min(utf16_len(text));
            self.surface.set_cursor(restored);
            self.state.lock().last_cursor = Some(restored);
        }
        self.persist(snapshot);
        self.render_remote_cursors();
        true
    }

    /// The surface content changed through user input
    pub fn handle_local_edit(&self) {
        let Some(_guard) = self.apply_lock.enter() else {
            return;
        };
        let text = self.surface.content();

        let snapshot = {
            let mut state = self.state.lock();
            if state.buffer.text == text {
                return;
            }
            state.buffer = SharedBuffer {
                text,
                last_modified_at_ms: now_ms(),
                last_modified_by: self.local_id().clone(),
            };
            self.snapshot(&state)
        };

        self.persist(snapshot);
        self.text_debouncer.push(());
    }

    /// Announce everything typed since the last announcement as one operation
    pub fn flush_local_edit(&self) {
        let operation = {
            let mut state = self.state.lock();
            let operation = diff_with(self.config.diff_strategy, &state.baseline, &state.buffer.text);
            state.baseline = state.buffer.text.clone();
            operation
        };

        let Some(operation) = operation else {
            debug!("Local edit has no single-operation form, peers catch up on next full sync");
            return;
        };
        match self.transport.broadcast(SyncMessage::TextOperation { operation }) {
            Ok(count) => debug!("Text operation sent to {} peer(s)", count),
            Err(e) => warn!("Failed to send text operation: {}", e),
        }
    }

    /// The caret moved on the surface
    pub fn handle_cursor_change(&self) {
        let Some(_guard) = self.apply_lock.enter() else {
            return;
        };
        let cursor = self.surface.cursor();
        {
            let mut state = self.state.lock();
            if state.last_cursor == cursor {
                return;
            }
            state.last_cursor = cursor;
        }
        self.cursor_debouncer.push(cursor);
    }

    fn announce_cursor(&self, position: Option<usize>) {
        match self
            .transport
            .broadcast(SyncMessage::CursorPosition { position })
        {
            Ok(count) => debug!("Cursor sent to {} peer(s)", count),
            Err(e) => warn!("Failed to send cursor: {}", e),
        }
    }

    pub fn handle_incoming_message(&self, message: &InboundMessage) {
        let envelope = &message.envelope;
        let sender = &envelope.participant_id;
        if sender == self.local_id() {
            return;
        }

        match &envelope.message {
            SyncMessage::TextOperation { operation } => {
                if let Err(e) = self.apply_operation(operation, sender) {
                    warn!("Failed to apply operation from {}: {}", sender, e);
                }
            }
            SyncMessage::CursorPosition { position } => {
                self.state.lock().cursors.update(
                    sender.clone(),
                    *position,
                    envelope.display_color.clone(),
                    message.received_at_ms,
                );
                self.render_remote_cursors();
            }
            SyncMessage::FullTextSync { text } => {
                self.handle_full_text_sync(text, sender);
            }
            SyncMessage::Heartbeat => {
                self.state.lock().cursors.touch(
                    sender.clone(),
                    envelope.display_color.clone(),
                    message.received_at_ms,
                );
            }
            SyncMessage::RoomChange { room_id } => {
                info!("{} moved to room {}", sender, room_id);
            }
        }
    }

    pub fn handle_connection_change(&self, event: &ConnectionEvent) {
        if !event.connected {
            let any_left = self.transport.is_connected();
            {
                let mut state = self.state.lock();
                state.cursors.remove(&event.peer_id);
                if !any_left {
                    state.cursors.clear();
                }
            }
            self.render_remote_cursors();
            return;
        }

        let message = SyncMessage::FullTextSync { text: self.text() };
        let sent = match (self.config.sync_on_connect, event.role) {
            (SyncOnConnect::Incumbent, LinkRole::Acceptor) => {
                self.transport.send(&event.peer_id, message)
            }
            (SyncOnConnect::Incumbent, LinkRole::Initiator) => Ok(0),
            (SyncOnConnect::Broadcast, _) => self.transport.broadcast(message),
        };
        match sent {
            Ok(count) => debug!(
                "Connected to {}, full text sent to {} peer(s)",
                event.peer_id, count
            ),
            Err(e) => warn!("Failed to send full text to {}: {}", event.peer_id, e),
        }
    }

    /// Evict stale cursors and draw the rest
    pub fn render_remote_cursors(&self) -> Vec<CursorIndicator> {
        let indicators = {
            let mut state = self.state.lock();
            let evicted = state
                .cursors
                .evict_stale(now_ms(), self.config.cursor_stale_after_ms);
            if evicted > 0 {
                debug!("Evicted {} stale cursor(s)", evicted);
            }
            state.cursors.indicators(&state.buffer.text)
        };
        self.surface.render_cursors(&indicators);
        indicators
    }

    /// Number of remote cursors currently tracked
    pub fn remote_cursor_count(&self) -> usize {
        self.state.lock().cursors.len()
    }

    /// Empty the buffer locally and for every peer
    pub fn clear_text(&self) -> Result<usize> {
        {
            let _guard = self.apply_lock.enter().ok_or(CollabError::ApplyInProgress)?;
            let snapshot = {
                let mut state = self.state.lock();
                state.baseline.clear();
                state.buffer = SharedBuffer {
                    text: String::new(),
                    last_modified_at_ms: now_ms(),
                    last_modified_by: self.local_id().clone(),
                };
                state.last_cursor = Some(0);
                self.snapshot(&state)
            };
            self.surface.set_content("");
            self.surface.set_cursor(0);
            self.persist(snapshot);
        }
        self.render_remote_cursors();
        self.transport.broadcast(SyncMessage::FullTextSync {
            text: String::new(),
        })
    }

    /// Broadcast the local buffer as-is
    pub fn send_full_text_sync(&self) -> Result<usize> {
        self.transport
            .broadcast(SyncMessage::FullTextSync { text: self.text() })
    }

    /// Wait until every snapshot queued so far has been written
    pub async fn flush_persistence(&self) {
        let (tx, rx) = oneshot::channel();
        if self.persist_tx.send(PersistJob::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn snapshot(&self, state: &EngineState) -> BufferSnapshot {
        BufferSnapshot {
            text: state.buffer.text.clone(),
            last_modified: state.buffer.last_modified_at_ms,
            user_id: self.local_id().clone(),
        }
    }

    fn persist(&self, snapshot: BufferSnapshot) {
        if self.persist_tx.send(PersistJob::Save(snapshot)).is_err() {
            warn!("Persistence writer is gone, snapshot dropped");
        }
    }
}

/// Single writer so snapshots land in the order they were taken
fn spawn_writer(store: Arc<dyn KeyValueStore>, key: String) -> mpsc::UnboundedSender<PersistJob> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                PersistJob::Save(snapshot) => {
                    if let Err(e) = snapshot.save(store.as_ref(), &key).await {
                        warn!("Failed to save buffer: {}", e);
                    }
                }
                PersistJob::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CollabError, DisplayColor, Envelope, HeadlessSurface, MemoryNetwork, MemoryStore,
        Participant, RoomId,
    };
    use std::sync::OnceLock;

    fn participant(id: &str) -> Participant {
        Participant {
            id: ParticipantId::from(id),
            color: DisplayColor::from("#BB8FCE"),
        }
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        surface: Arc<HeadlessSurface>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let network = MemoryNetwork::new();
        let me = participant("user_local_0001");
        let config = CollabConfig::default();
        let transport = PeerTransport::new(
            me.clone(),
            &config,
            network.connector(me.id.clone()),
            network.signaling(me.id),
        );
        let surface = Arc::new(HeadlessSurface::new());
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(transport, store.clone(), surface.clone(), config);
        Fixture {
            engine,
            surface,
            store,
        }
    }

    fn inbound(from: &str, message: SyncMessage, received_at_ms: i64) -> InboundMessage {
        InboundMessage {
            peer_id: ParticipantId::from(from),
            received_at_ms,
            envelope: Envelope::new(&participant(from), &RoomId::default(), message),
        }
    }

    #[tokio::test]
    async fn test_apply_operation_moves_cursor() {
        let f = fixture();
        let author = ParticipantId::from("user_remote_0002");
        f.surface.type_text("hello", 4);
        f.engine.handle_local_edit();

        f.engine
            .apply_operation(&Operation::insert(0, ">> "), &author)
            .unwrap();

        assert_eq!(f.engine.text(), ">> hello");
        assert_eq!(f.surface.content(), ">> hello");
        assert_eq!(f.surface.cursor(), Some(7));
        assert_eq!(f.engine.buffer().last_modified_by, author);
        assert!(!f.engine.is_applying());
    }

    #[tokio::test]
    async fn test_failed_apply_clears_gate() {
        let f = fixture();
        let author = ParticipantId::from("user_remote_0002");

        let result = f.engine.apply_operation(&Operation::delete(10, 3), &author);
        assert!(matches!(result, Err(CollabError::InvalidOp(_))));
        assert!(!f.engine.is_applying());

        f.engine
            .apply_operation(&Operation::insert(0, "ok"), &author)
            .unwrap();
        assert_eq!(f.engine.text(), "ok");
    }

    /// Surface that feeds every programmatic change straight back to the engine
    struct EchoSurface {
        inner: HeadlessSurface,
        engine: OnceLock<Weak<SyncEngine>>,
        nested: Mutex<Vec<bool>>,
    }

    impl TextSurface for EchoSurface {
        fn content(&self) -> String {
            self.inner.content()
        }

        fn set_content(&self, text: &str) {
            self.inner.set_content(text);
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                engine.handle_local_edit();
                let nested = engine
                    .apply_operation(&Operation::insert(0, "!"), &ParticipantId::from("x"));
                self.nested
                    .lock()
                    .push(matches!(nested, Err(CollabError::ApplyInProgress)));
            }
        }

        fn cursor(&self) -> Option<usize> {
            self.inner.cursor()
        }

        fn set_cursor(&self, position: usize) {
            self.inner.set_cursor(position);
        }
    }

    #[tokio::test]
    async fn test_reentrant_apply_refused() {
        let network = MemoryNetwork::new();
        let me = participant("user_local_0001");
        let config = CollabConfig::default();
        let transport = PeerTransport::new(
            me.clone(),
            &config,
            network.connector(me.id.clone()),
            network.signaling(me.id),
        );
        let surface = Arc::new(EchoSurface {
            inner: HeadlessSurface::new(),
            engine: OnceLock::new(),
            nested: Mutex::new(Vec::new()),
        });
        let engine = SyncEngine::new(
            transport,
            Arc::new(MemoryStore::new()),
            surface.clone(),
            config,
        );
        let _ = surface.engine.set(Arc::downgrade(&engine));

        engine
            .apply_operation(&Operation::insert(0, "abc"), &ParticipantId::from("r"))
            .unwrap();

        assert_eq!(engine.text(), "abc");
        assert_eq!(*surface.nested.lock(), vec![true]);
        assert!(!engine.is_applying());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_applies_all_land() {
        let f = fixture();
        let rounds = 2_000;

        let workers: Vec<_> = ["user_remote_0002", "user_remote_0003"]
            .into_iter()
            .map(|author| {
                let engine = f.engine.clone();
                tokio::task::spawn_blocking(move || {
                    let author = ParticipantId::from(author);
                    (0..rounds)
                        .filter(|_| {
                            engine
                                .apply_operation(&Operation::insert(0, "x"), &author)
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();

        let mut applied = 0;
        for worker in workers {
            applied += worker.await.unwrap();
        }

        assert_eq!(applied, 2 * rounds);
        assert_eq!(f.engine.text().len(), 2 * rounds);
        assert_eq!(f.surface.content(), f.engine.text());
        assert!(!f.engine.is_applying());
    }

    #[tokio::test]
    async fn test_full_sync_clamps_cursor_and_persists() {
        let f = fixture();
        f.surface.type_text("a long local draft", 18);
        f.engine.handle_local_edit();

        let author = ParticipantId::from("user_remote_0002");
        assert!(f.engine.handle_full_text_sync("short", &author));
        assert_eq!(f.surface.content(), "short");
        assert_eq!(f.surface.cursor(), Some(5));

        f.engine.flush_persistence().await;
        let stored = BufferSnapshot::load(f.store.as_ref(), "collaborativeText")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text, "short");
        assert_eq!(stored.user_id, ParticipantId::from("user_local_0001"));
    }

    #[tokio::test]
    async fn test_own_messages_ignored() {
        let f = fixture();
        let message = inbound(
            "user_local_0001",
            SyncMessage::FullTextSync {
                text: "echo".to_string(),
            },
            now_ms(),
        );
        f.engine.handle_incoming_message(&message);
        assert_eq!(f.engine.text(), "");
    }

    #[tokio::test]
    async fn test_cursor_and_heartbeat_marks() {
        let f = fixture();
        f.engine
            .handle_full_text_sync("line one\nline two", &ParticipantId::from("r"));

        let now = now_ms();
        f.engine.handle_incoming_message(&inbound(
            "user_remote_4321",
            SyncMessage::CursorPosition { position: Some(11) },
            now,
        ));
        let indicators = f.engine.render_remote_cursors();
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].label, "User 4321");
        assert_eq!((indicators[0].line, indicators[0].column), (1, 2));
        assert_eq!(f.surface.indicators(), indicators);

        f.engine.handle_incoming_message(&inbound(
            "user_remote_4321",
            SyncMessage::Heartbeat,
            now,
        ));
        f.engine.handle_incoming_message(&inbound(
            "user_silent_9999",
            SyncMessage::Heartbeat,
            now,
        ));

        assert!(f.engine.render_remote_cursors().is_empty());
        assert!(f.surface.indicators().is_empty());
        assert_eq!(f.engine.remote_cursor_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_cursor_evicted_on_render() {
        let f = fixture();
        f.engine.handle_incoming_message(&inbound(
            "user_remote_4321",
            SyncMessage::CursorPosition { position: Some(0) },
            now_ms() - 6_000,
        ));
        assert!(f.engine.render_remote_cursors().is_empty());
        assert_eq!(f.engine.remote_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_clears_cursors() {
        let f = fixture();
        f.engine.handle_incoming_message(&inbound(
            "user_remote_4321",
            SyncMessage::CursorPosition { position: Some(0) },
            now_ms(),
        ));
        f.engine.handle_connection_change(&ConnectionEvent {
            peer_id: ParticipantId::from("someone_else"),
            connected: false,
            role: LinkRole::Initiator,
        });
        assert_eq!(f.engine.remote_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_and_reload() {
        let f = fixture();
        f.surface.type_text("draft", 5);
        f.engine.handle_local_edit();
        assert_eq!(f.engine.clear_text().unwrap(), 0);
        assert_eq!(f.surface.content(), "");
        assert_eq!(f.surface.cursor(), Some(0));

        f.engine.flush_persistence().await;
        let stored = BufferSnapshot::load(f.store.as_ref(), "collaborativeText")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text, "");
    }

    #[tokio::test]
    async fn test_load_from_storage() {
        let f = fixture();
        assert!(!f.engine.load_from_storage().await.unwrap());

        BufferSnapshot {
            text: "restored".to_string(),
            last_modified: 42,
            user_id: ParticipantId::from("user_old_0001"),
        }
        .save(f.store.as_ref(), "collaborativeText")
        .await
        .unwrap();

        assert!(f.engine.load_from_storage().await.unwrap());
        assert_eq!(f.surface.content(), "restored");
        assert_eq!(f.engine.buffer().last_modified_at_ms, 42);
    }
}
