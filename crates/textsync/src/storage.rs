/// Key-value persistence for the shared buffer
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{CollabError, ParticipantId, Result};

/// Generic async key-value store provided by the host
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Values for the requested keys; missing keys are absent from the map
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>>;

    /// Insert or overwrite every entry of `items`
    async fn set(&self, items: HashMap<String, Value>) -> Result<()>;
}

/// Persisted form of the shared buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    pub text: String,

    /// Unix milliseconds of the last change
    pub last_modified: i64,

    /// Participant whose change produced this snapshot
    pub user_id: ParticipantId,
}

impl BufferSnapshot {
    /// Read the snapshot stored under `key`, if any
    pub async fn load(store: &dyn KeyValueStore, key: &str) -> Result<Option<Self>> {
        let mut values = store.get(&[key]).await?;
        match values.remove(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Overwrite the snapshot stored under `key`
    pub async fn save(&self, store: &dyn KeyValueStore, key: &str) -> Result<()> {
        let mut items = HashMap::new();
        items.insert(key.to_string(), serde_json::to_value(self)?);
        store.set(items).await
    }
}

/// Volatile store, mostly for tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let values = self.values.lock();
        Ok(keys
            .iter()
            .filter_map(|k| values.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        self.values.lock().extend(items);
        Ok(())
    }
}

/// Store backed by one JSON object in a file
pub struct JsonFileStore {
    path: PathBuf,

    /// Serializes read-merge-write cycles
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, Value>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let json = fs::read_to_string(&self.path).await.map_err(|e| {
            CollabError::StorageError(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        if json.trim().is_empty() {
            return Ok(HashMap::new());
        }

        serde_json::from_str(&json).map_err(|e| {
            CollabError::StorageError(format!("Corrupt store {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let mut all = self.read_all().await?;
        Ok(keys
            .iter()
            .filter_map(|k| all.remove(*k).map(|v| (k.to_string(), v)))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut all = self.read_all().await?;
        all.extend(items);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    CollabError::StorageError(format!("Failed to create storage directory: {}", e))
                })?;
            }
        }

        let json = serde_json::to_string_pretty(&all)?;
        fs::write(&self.path, json).await.map_err(|e| {
            CollabError::StorageError(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot(text: &str) -> BufferSnapshot {
        BufferSnapshot {
            text: text.to_string(),
            last_modified: 1_700_000_000_000,
            user_id: ParticipantId::from("user_abc_1"),
        }
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let value = serde_json::to_value(snapshot("hi")).unwrap();
        assert_eq!(value["text"], "hi");
        assert_eq!(value["lastModified"], 1_700_000_000_000i64);
        assert_eq!(value["userId"], "user_abc_1");
    }

    #[tokio::test]
    async fn test_memory_store_snapshot() {
        let store = MemoryStore::new();
        assert_eq!(
            BufferSnapshot::load(&store, "collaborativeText").await.unwrap(),
            None
        );

        snapshot("one").save(&store, "collaborativeText").await.unwrap();
        snapshot("two").save(&store, "collaborativeText").await.unwrap();

        let loaded = BufferSnapshot::load(&store, "collaborativeText")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.text, "two");
    }

    #[tokio::test]
    async fn test_file_store_merges_keys() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("store.json"));

        let mut first = HashMap::new();
        first.insert("other".to_string(), serde_json::json!([1, 2]));
        store.set(first).await.unwrap();
        snapshot("persisted")
            .save(&store, "collaborativeText")
            .await
            .unwrap();

        let values = store.get(&["other", "collaborativeText", "missing"]).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["other"], serde_json::json!([1, 2]));

        let reopened = JsonFileStore::new(store.path());
        let loaded = BufferSnapshot::load(&reopened, "collaborativeText")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.text, "persisted");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{broken").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.get(&["collaborativeText"]).await,
            Err(CollabError::StorageError(_))
        ));
    }
}
