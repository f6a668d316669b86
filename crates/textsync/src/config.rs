/// Collaboration settings
/// Every field has a default so partial JSON files are accepted
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CollabError, Result, RoomId};

/// A STUN/TURN server entry handed to peer connectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: String,
}

impl IceServer {
    pub fn new(urls: impl Into<String>) -> Self {
        Self { urls: urls.into() }
    }
}

/// How a local edit is turned into an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStrategy {
    /// Quadratic candidate scan, picks the smallest matching offset
    Scan,

    /// Linear common prefix / common suffix comparison
    PrefixSuffix,
}

impl Default for DiffStrategy {
    fn default() -> Self {
        Self::Scan
    }
}

/// Who sends the full buffer when a new peer link opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOnConnect {
    /// The peer that was already in the room sends its buffer to the newcomer
    Incumbent,

    /// Every newly connected side broadcasts its buffer; last one wins
    Broadcast,
}

impl Default for SyncOnConnect {
    fn default() -> Self {
        Self::Incumbent
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Room joined at startup
    pub room_id: RoomId,

    /// ICE servers for peer connections (STUN only, no relay fallback)
    pub ice_servers: Vec<IceServer>,

    /// Label of the per-peer data channel
    pub channel_label: String,

    /// Interval between heartbeat broadcasts
    pub heartbeat_interval_ms: u64,

    /// Trailing debounce for text operations
    pub text_debounce_ms: u64,

    /// Trailing debounce for cursor updates
    pub cursor_debounce_ms: u64,

    /// Remote cursors not seen for longer than this are evicted on render
    pub cursor_stale_after_ms: i64,

    /// Key of the buffer snapshot in the key-value store
    pub storage_key: String,

    pub diff_strategy: DiffStrategy,

    pub sync_on_connect: SyncOnConnect,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            room_id: RoomId::default(),
            ice_servers: vec![
                IceServer::new("stun:stun.l.google.com:19302"),
                IceServer::new("stun:stun1.l.google.com:19302"),
            ],
            channel_label: "collaboration".to_string(),
            heartbeat_interval_ms: 30_000,
            text_debounce_ms: 100,
            cursor_debounce_ms: 50,
            cursor_stale_after_ms: 5_000,
            storage_key: "collaborativeText".to_string(),
            diff_strategy: DiffStrategy::default(),
            sync_on_connect: SyncOnConnect::default(),
        }
    }
}

impl CollabConfig {
    /// Load settings from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            CollabError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: CollabConfig = serde_json::from_str(json)
            .map_err(|e| CollabError::ConfigError(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(CollabError::ConfigError(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.storage_key.is_empty() {
            return Err(CollabError::ConfigError(
                "storage_key must not be empty".to_string(),
            ));
        }
        if self.ice_servers.iter().any(|s| s.urls.starts_with("turn")) {
            return Err(CollabError::ConfigError(
                "relay (TURN) servers are not supported".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn text_debounce(&self) -> Duration {
        Duration::from_millis(self.text_debounce_ms)
    }

    pub fn cursor_debounce(&self) -> Duration {
        Duration::from_millis(self.cursor_debounce_ms)
    }
}
