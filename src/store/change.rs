//! Change notifications emitted by the local store.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Kind of store mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Delete,
    /// Server-authoritative set replacement for one cache key.
    Replace,
    /// Records loaded from the persistence backend.
    Hydrate,
    /// Everything removed (logout).
    Purge,
}

/// One coalesced notification per mutating store call.
///
/// Delivered after the mutation is durably applied and published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub resource_type: &'static str,
    pub kind: ChangeKind,
    /// Table version after the mutation.
    pub version: u64,
    /// Records inserted or updated.
    pub upserted: usize,
    /// Records removed.
    pub removed: usize,
}

/// Change stream for one resource type.
pub struct ChangeSubscription {
    resource_type: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeSubscription {
    pub(crate) fn new(resource_type: &str, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        ChangeSubscription {
            resource_type: resource_type.to_string(),
            rx,
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Next event for this resource type. `None` once the store is dropped.
    ///
    /// A slow subscriber that falls behind skips the missed events; the table
    /// snapshot is always current, so consumers re-read it rather than replay.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.resource_type == self.resource_type => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(
                        "Change subscriber for {} lagged, {} events skipped",
                        self.resource_type, missed
                    );
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.resource_type == self.resource_type => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
