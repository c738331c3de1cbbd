//! Persistence backends for the local store.
//!
//! The local store keeps its live tables in memory and writes every mutation
//! through a [`PersistenceBackend`] before publishing it. Crash durability and
//! on-disk layout are the backend's concern.

use crate::error::{Error, Result};
use std::future::Future;

pub mod inmemory;

pub use inmemory::InMemoryBackend;

/// One write in a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// All persistence writes produced by one store mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn put(&mut self, key: String, value: Vec<u8>) {
        self.ops.push(WriteOp::Put(key, value));
    }

    pub fn delete(&mut self, key: String) {
        self.ops.push(WriteOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Trait for durable key-indexed storage behind the local store.
///
/// All methods take `&self`; implementations use interior mutability or external
/// storage. Returned futures are `Send` so writes can run on spawned refresh tasks.
pub trait PersistenceBackend: Send + Sync + Clone + 'static {
    /// Retrieve a stored value.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unavailable.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store a value, replacing any previous one.
    ///
    /// # Errors
    /// Returns `Err` if the backend rejects the write.
    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Remove a value. Removing a missing key is not an error.
    ///
    /// # Errors
    /// Returns `Err` if the backend rejects the write.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Every stored entry whose key starts with `prefix`.
    ///
    /// # Errors
    /// Returns `Err` if the backend is unavailable.
    fn scan_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<(String, Vec<u8>)>>> + Send;

    /// Apply every write of one store mutation.
    ///
    /// Default implementation applies the ops one by one and stops at the first
    /// failure. Override when the backend offers transactions.
    ///
    /// # Errors
    /// Returns `Err` on the first failed write.
    fn apply(&self, batch: WriteBatch) -> impl Future<Output = Result<()>> + Send {
        async move {
            for op in batch.ops {
                match op {
                    WriteOp::Put(key, value) => self.set(&key, value).await?,
                    WriteOp::Delete(key) => self.delete(&key).await?,
                }
            }
            Ok(())
        }
    }

    /// Health check - verify backend is accessible.
    ///
    /// # Errors
    /// Returns `Err` if backend is not accessible
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }

    /// Remove everything (logout).
    ///
    /// # Errors
    /// Returns `Err` if the operation is not supported or fails
    fn clear_all(&self) -> impl Future<Output = Result<()>> + Send {
        async {
            Err(Error::Persistence(
                "clear_all not supported by this backend".to_string(),
            ))
        }
    }
}
