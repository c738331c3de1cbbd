//! Refresh configuration.

use crate::error::{Error, Result};
use crate::observability::FreshnessPolicy;
use crate::paginate::DEFAULT_MAX_PAGES;
use crate::store::DEFAULT_CHANGE_BUFFER;

/// Tunables shared by the coordinator and its operations.
///
/// ```
/// use sync_kit::config::SyncConfig;
/// use sync_kit::observability::FreshnessPolicy;
/// use std::time::Duration;
///
/// let config = SyncConfig::default()
///     .with_freshness(FreshnessPolicy::MaxAge(Duration::from_secs(3600)))
///     .with_max_pages(500);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub freshness: FreshnessPolicy,
    /// Hard cap on pages per drain; exceeding it fails with `CycleDetected`.
    pub max_pages: usize,
    /// Broadcast capacity for store change streams.
    pub change_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            freshness: FreshnessPolicy::Never,
            max_pages: DEFAULT_MAX_PAGES,
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }
}

impl SyncConfig {
    pub fn with_freshness(mut self, freshness: FreshnessPolicy) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_change_buffer(mut self, change_buffer: usize) -> Self {
        self.change_buffer = change_buffer;
        self
    }

    /// # Errors
    ///
    /// Returns `Error::Config` for a zero page cap or change buffer.
    pub fn validate(&self) -> Result<()> {
        if self.max_pages == 0 {
            return Err(Error::Config("max_pages must be at least 1".to_string()));
        }
        if self.change_buffer == 0 {
            return Err(Error::Config(
                "change_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
