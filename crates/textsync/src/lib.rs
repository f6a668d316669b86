/// Peer-to-peer collaborative text synchronization
/// A peer transport plus a diff-based sync engine sharing one text buffer
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod config;
pub use config::*;

mod operations;
pub use operations::*;

mod message;
pub use message::*;

mod presence;
pub use presence::*;

mod link;
pub use link::*;

mod signaling;
pub use signaling::*;

mod memory;
pub use memory::*;

mod ws;
pub use ws::*;

mod transport;
pub use transport::*;

mod storage;
pub use storage::*;

mod debounce;
pub use debounce::*;

mod surface;
pub use surface::*;

mod sync;
pub use sync::*;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("an apply is already in progress")]
    ApplyInProgress,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("signaling error: {0}")]
    SignalingError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// Opaque identifier of one participant, unique for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    /// Generate a fresh id of the form `user_<9 chars>_<unix ms>`
    pub fn generate() -> Self {
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("user_{}_{}", &random[..9], now_ms()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last four characters, used to label cursor indicators
    pub fn short(&self) -> &str {
        let start = self
            .0
            .char_indices()
            .rev()
            .nth(3)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        &self.0[start..]
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Named synchronization scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub const DEFAULT: &'static str = "default_room";

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Wall-clock milliseconds since the unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
