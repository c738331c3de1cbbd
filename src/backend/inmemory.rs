//! In-memory persistence backend (default, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding. Nothing survives the
//! process; use it for tests and for sessions that do not need offline data.

use super::{PersistenceBackend, WriteBatch, WriteOp};
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// Thread-safe async in-memory persistence backend.
///
/// Clones share the same underlying map.
///
/// # Example
///
/// ```no_run
/// use sync_kit::backend::{InMemoryBackend, PersistenceBackend};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = InMemoryBackend::new();
///     backend.set("module:1", b"bytes".to_vec()).await?;
///     assert!(backend.get("module:1").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Current number of stored entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            total_entries: self.store.len(),
            total_bytes: self.store.iter().map(|entry| entry.value().len()).sum(),
        }
    }
}

impl PersistenceBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries: Vec<(String, Vec<u8>)> = self
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        debug!("✓ InMemory SCAN {} -> {} entries", prefix, entries.len());
        Ok(entries)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let count = batch.len();
        for op in batch.ops {
            match op {
                WriteOp::Put(key, value) => {
                    self.store.insert(key, value);
                }
                WriteOp::Delete(key) => {
                    self.store.remove(&key);
                }
            }
        }
        debug!("✓ InMemory APPLY {} ops", count);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory CLEAR_ALL executed - all persisted records removed");
        Ok(())
    }
}

/// Backend statistics.
#[derive(Clone, Debug)]
pub struct BackendStats {
    pub total_entries: usize,
    pub total_bytes: usize,
}
