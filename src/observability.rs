//! Observability hooks and freshness policies for refresh operations.
//!
//! # Metrics
//!
//! Implement [`SyncMetrics`] to feed refresh statistics into your monitoring
//! system:
//!
//! ```ignore
//! use sync_kit::observability::SyncMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl SyncMetrics for PrometheusMetrics {
//!     fn record_fetch(&self, key: &CacheKey, pages: usize, items: usize, duration: Duration) {
//!         // histogram!("sync_fetch_latency").record(duration);
//!     }
//!     // ... other hooks keep their logging defaults
//! }
//!
//! // let coordinator = RefreshCoordinator::new(scope, store)
//! //     .with_metrics(Arc::new(PrometheusMetrics));
//! ```
//!
//! The default hooks log through the `log` crate. [`NoOpMetrics`] silences them.
//!
//! # Freshness
//!
//! By default a successfully fetched key stays fresh until it is forced or
//! invalidated. A [`FreshnessPolicy`] adds age-based staleness:
//!
//! ```
//! use sync_kit::observability::FreshnessPolicy;
//! use std::time::Duration;
//!
//! let _policy = FreshnessPolicy::MaxAge(Duration::from_secs(3600));
//!
//! let _policy = FreshnessPolicy::PerType(|resource_type| match resource_type {
//!     "planner_item" => Duration::from_secs(300),
//!     _ => Duration::from_secs(3600),
//! });
//! ```

use crate::key::CacheKey;
use std::time::Duration;
use tokio::time::Instant;

/// Hooks for refresh lifecycle events.
pub trait SyncMetrics: Send + Sync {
    /// A drain finished.
    fn record_fetch(&self, key: &CacheKey, pages: usize, items: usize, duration: Duration) {
        debug!(
            "Sync FETCH: {} ({} pages, {} items) took {:?}",
            key, pages, items, duration
        );
    }

    /// A `refresh` call joined an in-flight fetch.
    fn record_coalesced(&self, key: &CacheKey) {
        debug!("Sync COALESCED: {}", key);
    }

    /// A refresh wrote to the local store.
    fn record_persist(&self, key: &CacheKey, upserted: usize, removed: usize) {
        debug!("Sync PERSIST: {} (+{} -{})", key, upserted, removed);
    }

    fn record_error(&self, key: &CacheKey, error: &str) {
        warn!("Sync ERROR for {}: {}", key, error);
    }

    fn record_cancel(&self, key: &CacheKey) {
        debug!("Sync CANCEL: {}", key);
    }
}

/// Logging metrics, the coordinator's default.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl SyncMetrics for LogMetrics {}

/// Metrics that record nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpMetrics;

impl SyncMetrics for NoOpMetrics {
    fn record_fetch(&self, _key: &CacheKey, _pages: usize, _items: usize, _duration: Duration) {}
    fn record_coalesced(&self, _key: &CacheKey) {}
    fn record_persist(&self, _key: &CacheKey, _upserted: usize, _removed: usize) {}
    fn record_error(&self, _key: &CacheKey, _error: &str) {}
    fn record_cancel(&self, _key: &CacheKey) {}
}

/// Age-based staleness for successfully fetched keys.
#[derive(Clone, Copy, Debug, Default)]
pub enum FreshnessPolicy {
    /// Fresh until forced or invalidated.
    #[default]
    Never,

    /// Stale once the last success is older than this.
    MaxAge(Duration),

    /// Max age chosen by resource type (the cache key's first segment).
    PerType(fn(&str) -> Duration),
}

impl FreshnessPolicy {
    /// Maximum age for a key, if any.
    pub fn max_age(&self, key: &CacheKey) -> Option<Duration> {
        match self {
            FreshnessPolicy::Never => None,
            FreshnessPolicy::MaxAge(age) => Some(*age),
            FreshnessPolicy::PerType(f) => Some(f(key.resource_type())),
        }
    }

    pub fn is_expired(&self, key: &CacheKey, fetched_at: Instant) -> bool {
        self.max_age(key)
            .is_some_and(|age| fetched_at.elapsed() >= age)
    }
}
