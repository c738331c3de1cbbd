//! Cooperative cancellation for in-flight drains.

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Clone-able cancellation flag shared by a refresh and its paginator drain.
///
/// Every clone observes the same flag; cancelling is idempotent and permanent.
#[derive(Clone, Debug)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Cancellation {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Wakes every task waiting in [`Cancellation::cancelled`].
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Error::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
