//! Durable storage collaborator.
//!
//! The scheduler and the discovery bus persist snapshots through
//! [`DurableStore`]. Writes are whole-value replacements keyed by a
//! slash-separated path; readers only ever need the latest value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::StoreError;

/// Key/value persistence used off the hot path.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Replace the value stored under `key`.
    async fn store(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Load the most recently stored value for `key`, if any.
    async fn load_latest(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
}

/// Blanket implementation so `Arc<dyn DurableStore>` can be used directly.
#[async_trait]
impl<T: DurableStore + ?Sized> DurableStore for Arc<T> {
    async fn store(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        (**self).store(key, value).await
    }

    async fn load_latest(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        (**self).load_latest(key).await
    }
}

/// Build the store selected by `config`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn DurableStore>, StoreError> {
    match config.backend {
        StorageBackendKind::Memory => {
            info!("Storage: in-memory backend");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackendKind::File => Ok(Arc::new(FileStore::new(&config.data_dir)?)),
    }
}

/// Keys are relative paths: `[A-Za-z0-9_-]` segments separated by `/`.
fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.split('/').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

// ── In-memory ─────────────────────────────────────────────────

/// Process-local store. Useful for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, serde_json::Value>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn store(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        validate_key(key)?;
        self.values.write().await.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_latest(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        validate_key(key)?;
        Ok(self.values.read().await.get(key).cloned())
    }
}

// ── JSON files ────────────────────────────────────────────────

/// One pretty-printed JSON file per key under a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a half-written file.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        info!("Storage: file backend at {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for seg in key.split('/') {
            path.push(seg);
        }
        path.set_extension("json");
        path
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn store(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        validate_key(key)?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key, bytes = bytes.len(), "stored value");
        Ok(())
    }

    async fn load_latest(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        validate_key(key)?;
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_validation() {
        assert!(validate_key("discovery/history").is_ok());
        assert!(validate_key("scheduler/task-state_v2").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/b.json").is_err());
    }

    #[tokio::test]
    async fn memory_store_keeps_latest() {
        let store = MemoryStore::new();
        assert!(store.load_latest("k").await.unwrap().is_none());

        store.store("k", json!({"v": 1})).await.unwrap();
        store.store("k", json!({"v": 2})).await.unwrap();

        assert_eq!(store.load_latest("k").await.unwrap(), Some(json!({"v": 2})));
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn file_store_roundtrip_nested_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        store
            .store("discovery/history", json!([{"kind": "arb"}]))
            .await
            .unwrap();

        assert!(dir.path().join("discovery").join("history.json").exists());
        let loaded = store.load_latest("discovery/history").await.unwrap();
        assert_eq!(loaded, Some(json!([{"kind": "arb"}])));
        assert!(store.load_latest("discovery/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let err = store.store("../escape", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn open_store_memory_backend() {
        let config = StorageConfig {
            backend: StorageBackendKind::Memory,
            ..StorageConfig::default()
        };
        let store = open_store(&config).unwrap();
        store.store("x", json!(true)).await.unwrap();
        assert_eq!(store.load_latest("x").await.unwrap(), Some(json!(true)));
    }
}
