/// Peer links: one connection plus one ordered, reliable data channel per peer
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{IceServer, ParticipantId, Result, Signaling};

/// Lifecycle of the connection to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Discovering,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Live or pending connections keep their entry in the peer map
    pub fn is_live(&self) -> bool {
        !matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// Lifecycle of the data channel inside a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
    Errored,
}

/// Which side opened a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRole {
    /// The local side opened the link
    Initiator,

    /// The remote side opened the link and we accepted it
    Acceptor,
}

/// Events reported by a link, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    ChannelOpened,
    Message(String),
    ChannelClosed,
    ChannelErrored(String),
}

/// Options for a new peer connection
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub ice_servers: Vec<IceServer>,

    /// Label of the data channel
    pub channel_label: String,
}

/// Control side of a link
pub trait PeerHandle: Send + Sync {
    /// Queue `text` on the data channel
    fn send(&self, text: &str) -> Result<()>;

    /// Close the channel and the connection; safe to call twice
    fn close(&self);
}

/// A constructed link; completion is observed through `events`
pub struct PeerLink {
    pub handle: Arc<dyn PeerHandle>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink").finish_non_exhaustive()
    }
}

/// Builds peer links. Negotiation data travels out-of-band through `signaling`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Open a link towards `remote`; the local side becomes the initiator
    async fn open(
        &self,
        remote: &ParticipantId,
        options: &LinkOptions,
        signaling: Arc<dyn Signaling>,
    ) -> Result<PeerLink>;

    /// Handle a negotiation blob from `from`; may yield an accepted link
    async fn negotiate(
        &self,
        from: &ParticipantId,
        payload: serde_json::Value,
        options: &LinkOptions,
        signaling: Arc<dyn Signaling>,
    ) -> Result<Option<PeerLink>>;
}
