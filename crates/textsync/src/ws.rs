/// WebSocket plumbing: a signaling client for the relay server and a
/// direct peer connector that carries the data channel over a socket
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::{
    CollabError, ConnectionState, LinkEvent, LinkOptions, ParticipantId, PeerConnector,
    PeerHandle, PeerLink, Result, RoomId, SignalEvent, SignalFrame, Signaling,
};

/// How long an accepted socket may take to identify itself
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Signaling client of the relay server
pub struct WsSignaling {
    url: String,
    session: Mutex<Option<SignalSession>>,
}

struct SignalSession {
    local: ParticipantId,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl WsSignaling {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session: Mutex::new(None),
        }
    }

    fn send_frame(&self, frame: &SignalFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        let session = self.session.lock();
        let session = session
            .as_ref()
            .ok_or_else(|| CollabError::SignalingError("not joined to a room".to_string()))?;
        session
            .outgoing
            .send(Message::Text(json))
            .map_err(|_| CollabError::SignalingError("relay connection closed".to_string()))
    }
}

#[async_trait]
impl Signaling for WsSignaling {
    async fn join(
        &self,
        room: &RoomId,
        local: &ParticipantId,
    ) -> Result<mpsc::UnboundedReceiver<SignalEvent>> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                CollabError::SignalingError(format!("failed to reach {}: {}", self.url, e))
            })?;
        info!("Connected to signaling relay {}", self.url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Failed to send to signaling relay: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let pong_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data));
                        continue;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling relay connection failed: {}", e);
                        break;
                    }
                };

                match serde_json::from_str::<SignalFrame>(&text) {
                    Ok(SignalFrame::Error { message }) => {
                        warn!("Signaling relay reported: {}", message)
                    }
                    Ok(frame) => {
                        if let Some(event) = frame.into_event() {
                            if events_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => warn!("Dropping malformed signaling frame: {}", e),
                }
            }
            debug!("Signaling reader finished");
        });

        *self.session.lock() = Some(SignalSession {
            local: local.clone(),
            outgoing: tx,
        });

        self.send_frame(&SignalFrame::Join {
            room_id: room.clone(),
            participant_id: local.clone(),
        })?;

        Ok(events_rx)
    }

    async fn send(&self, to: &ParticipantId, payload: serde_json::Value) -> Result<()> {
        let from = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.local.clone())
            .ok_or_else(|| CollabError::SignalingError("not joined to a room".to_string()))?;

        self.send_frame(&SignalFrame::Signal {
            from,
            to: to.clone(),
            payload,
        })
    }

    async fn leave(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        let json = serde_json::to_string(&SignalFrame::Leave)?;
        let _ = session.outgoing.send(Message::Text(json));
        let _ = session.outgoing.send(Message::Close(None));
        Ok(())
    }
}

/// Negotiation blobs exchanged through signaling by `WsConnector`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WsNegotiation {
    /// The initiator listens at `addr` and waits to be dialed
    Offer { addr: SocketAddr, label: String },

    /// The acceptor could not dial the offered address
    Reject { reason: String },
}

/// First frame on a dialed socket, naming the dialing participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Hello {
    participant_id: ParticipantId,
}

enum Outgoing {
    Text(String),
    Close,
}

/// An offered link waiting for the remote side to dial in
struct PendingSocket {
    events: mpsc::UnboundedSender<LinkEvent>,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,

    /// Shared with the handle that owns this offer
    closed: Arc<AtomicBool>,
}

type PendingMap = Arc<Mutex<HashMap<ParticipantId, PendingSocket>>>;

/// Direct peer connector: the initiator listens, the acceptor dials
pub struct WsConnector {
    local: ParticipantId,
    local_addr: SocketAddr,
    pending: PendingMap,
    accept_task: JoinHandle<()>,
}

impl WsConnector {
    /// Listen for dialing peers on `addr`
    pub async fn bind(local: ParticipantId, addr: SocketAddr) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Peer connector listening on: {}", local_addr);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(listener, pending.clone()));

        Ok(Arc::new(Self {
            local,
            local_addr,
            pending,
            accept_task,
        }))
    }

    /// Address advertised in offers
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for WsConnector {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl PeerConnector for WsConnector {
    async fn open(
        &self,
        remote: &ParticipantId,
        options: &LinkOptions,
        signaling: Arc<dyn Signaling>,
    ) -> Result<PeerLink> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = WsHandle::offered(out_tx, self.pending.clone(), remote.clone());

        let _ = events_tx.send(LinkEvent::StateChanged(ConnectionState::Connecting));
        self.pending.lock().insert(
            remote.clone(),
            PendingSocket {
                events: events_tx,
                outgoing: out_rx,
                closed: handle.closed.clone(),
            },
        );

        let offer = WsNegotiation::Offer {
            addr: self.local_addr,
            label: options.channel_label.clone(),
        };
        if let Err(e) = signaling.send(remote, serde_json::to_value(&offer)?).await {
            self.pending.lock().remove(remote);
            return Err(e);
        }

        Ok(PeerLink {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }

    async fn negotiate(
        &self,
        from: &ParticipantId,
        payload: serde_json::Value,
        _options: &LinkOptions,
        signaling: Arc<dyn Signaling>,
    ) -> Result<Option<PeerLink>> {
        let negotiation: WsNegotiation = serde_json::from_value(payload)
            .map_err(|e| CollabError::NetworkError(format!("bad negotiation blob: {}", e)))?;

        let addr = match negotiation {
            WsNegotiation::Offer { addr, .. } => addr,
            WsNegotiation::Reject { reason } => {
                if let Some(pending) = self.pending.lock().remove(from) {
                    let _ = pending.events.send(LinkEvent::ChannelErrored(reason));
                    let _ = pending
                        .events
                        .send(LinkEvent::StateChanged(ConnectionState::Closed));
                }
                return Ok(None);
            }
        };

        let mut ws_stream = match tokio_tungstenite::connect_async(format!("ws://{}", addr)).await
        {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                warn!("Cannot reach {} at {}: {}", from, addr, e);
                let reject = WsNegotiation::Reject {
                    reason: format!("{} cannot reach {}", self.local, addr),
                };
                signaling.send(from, serde_json::to_value(&reject)?).await?;
                return Ok(None);
            }
        };

        let hello = serde_json::to_string(&Hello {
            participant_id: self.local.clone(),
        })?;
        ws_stream
            .send(Message::Text(hello))
            .await
            .map_err(|e| CollabError::NetworkError(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(LinkEvent::StateChanged(ConnectionState::Connected));
        let _ = events_tx.send(LinkEvent::ChannelOpened);
        tokio::spawn(drive_socket(ws_stream, events_tx, out_rx));

        Ok(Some(PeerLink {
            handle: Arc::new(WsHandle::new(out_tx)),
            events: events_rx,
        }))
    }
}

async fn accept_loop(listener: TcpListener, pending: PendingMap) {
    while let Ok((stream, addr)) = listener.accept().await {
        debug!("Peer socket from: {}", addr);
        tokio::spawn(handle_incoming(stream, addr, pending.clone()));
    }
}

async fn handle_incoming(stream: TcpStream, addr: SocketAddr, pending: PendingMap) {
    let mut ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, ws_stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<Hello>(&text).ok(),
        _ => None,
    };
    let Some(hello) = hello else {
        warn!("Peer socket from {} did not identify itself", addr);
        let _ = ws_stream.close(None).await;
        return;
    };

    let Some(socket) = pending.lock().remove(&hello.participant_id) else {
        warn!("No offer pending for {}", hello.participant_id);
        let _ = ws_stream.close(None).await;
        return;
    };

    info!("Peer {} connected from {}", hello.participant_id, addr);
    let _ = socket
        .events
        .send(LinkEvent::StateChanged(ConnectionState::Connected));
    let _ = socket.events.send(LinkEvent::ChannelOpened);
    drive_socket(ws_stream, socket.events, socket.outgoing).await;
}

/// Pump one socket until either side closes it
async fn drive_socket<S>(
    ws_stream: WebSocketStream<S>,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let failure = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = ws_sender.send(Message::Text(text)).await {
                        break Some(e.to_string());
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break None;
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(LinkEvent::Message(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
            },
        }
    };

    match failure {
        Some(reason) => {
            let _ = events.send(LinkEvent::ChannelErrored(reason));
        }
        None => {
            let _ = events.send(LinkEvent::ChannelClosed);
        }
    }
    let _ = events.send(LinkEvent::StateChanged(ConnectionState::Closed));
}

struct WsHandle {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closed: Arc<AtomicBool>,

    /// Offer to withdraw if closed before the remote side dials in
    offer: Option<(PendingMap, ParticipantId)>,
}

impl WsHandle {
    fn new(outgoing: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            outgoing,
            closed: Arc::new(AtomicBool::new(false)),
            offer: None,
        }
    }

    fn offered(
        outgoing: mpsc::UnboundedSender<Outgoing>,
        pending: PendingMap,
        remote: ParticipantId,
    ) -> Self {
        Self {
            offer: Some((pending, remote)),
            ..Self::new(outgoing)
        }
    }

    fn withdraw_offer(&self) {
        let Some((pending, remote)) = &self.offer else {
            return;
        };
        let mut pending = pending.lock();
        let ours = pending
            .get(remote)
            .is_some_and(|socket| Arc::ptr_eq(&socket.closed, &self.closed));
        if ours {
            debug!("Withdrawing unanswered offer to {}", remote);
            pending.remove(remote);
        }
    }
}

impl PeerHandle for WsHandle {
    fn send(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollabError::NetworkError("channel closed".to_string()));
        }
        self.outgoing
            .send(Outgoing::Text(text.to_string()))
            .map_err(|_| CollabError::NetworkError("socket closed".to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outgoing.send(Outgoing::Close);
            self.withdraw_offer();
        }
    }
}
