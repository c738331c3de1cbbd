//! Refresh coordination: when to fetch, and at most one fetch per key.
//!
//! # State machine (per cache key)
//!
//! ```text
//!          refresh() + stale            op Ok
//!  Idle ──────────────────▶ Fetching ─────────▶ Succeeded ─┐
//!   ▲                          │  │                         │
//!   │                          │  └── op Err ──▶ Failed ────┤
//!   │                          └── cancel ─────▶ (unchanged)┤
//!   └───────────────────────────────────────────────────────┘
//! ```
//!
//! While a key is `Fetching`, further `refresh` calls attach to the in-flight
//! generation and receive its terminal result. The check and the transition to
//! `Fetching` happen under the key's map entry lock, so concurrent callers can
//! never start two fetches.
//!
//! A failed refresh leaves the stored records as they were and records
//! `last_error`. Nothing is retried automatically.

use crate::backend::{InMemoryBackend, PersistenceBackend};
use crate::cancel::Cancellation;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::key::CacheKey;
use crate::observability::{LogMetrics, SyncMetrics};
use crate::operation::{SyncContext, SyncOperation, SyncSummary};
use crate::scope::Scope;
use crate::store::LocalStore;
use crate::strategy::RefreshStrategy;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::Instant;

/// Per-key refresh bookkeeping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefreshState {
    /// Completion time of the last successful refresh.
    pub last_fetched_at: Option<Instant>,
    pub in_flight: bool,
    /// Error of the last completed refresh, cleared by the next success.
    pub last_error: Option<Error>,
    /// A sibling refresh removed records from this key's result set.
    pub invalidated: bool,
    /// Number of fetches started for this key.
    pub generation: u64,
}

/// Coarse view of [`RefreshState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Fetching,
    Succeeded,
    Failed,
}

impl RefreshState {
    pub fn phase(&self) -> RefreshPhase {
        if self.in_flight {
            RefreshPhase::Fetching
        } else if self.last_error.is_some() {
            RefreshPhase::Failed
        } else if self.last_fetched_at.is_some() {
            RefreshPhase::Succeeded
        } else {
            RefreshPhase::Idle
        }
    }
}

/// Terminal result of a successful `refresh`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cached data was good enough; nothing was fetched.
    Fresh,
    /// A fetch ran and its results were persisted.
    Fetched(SyncSummary),
}

type SharedResult = Shared<BoxFuture<'static, Result<RefreshOutcome>>>;

struct InFlight {
    generation: u64,
    cancel: Cancellation,
    result: SharedResult,
}

struct KeyEntry<B: PersistenceBackend> {
    operation: Option<Arc<dyn SyncOperation<B>>>,
    state: RefreshState,
    in_flight: Option<InFlight>,
}

impl<B: PersistenceBackend> Default for KeyEntry<B> {
    fn default() -> Self {
        KeyEntry {
            operation: None,
            state: RefreshState::default(),
            in_flight: None,
        }
    }
}

type Entries<B> = Arc<DashMap<CacheKey, KeyEntry<B>>>;

/// Decides when keys need a refresh and runs their operations.
///
/// Cheap to clone; clones share state. `refresh` spawns onto the current Tokio
/// runtime.
///
/// ```ignore
/// let coordinator = RefreshCoordinator::new(scope, store.clone());
/// coordinator.register(key.clone(), CollectionSync::<Assignment, _>::new(transport, request))?;
///
/// // Pull to refresh
/// match coordinator.refresh(&key, true).await {
///     Ok(outcome) => info!("refreshed: {:?}", outcome),
///     Err(e) if e.is_user_visible() => show_banner(e),
///     Err(_) => {}
/// }
/// ```
#[derive(Clone)]
pub struct RefreshCoordinator<B: PersistenceBackend = InMemoryBackend> {
    scope: Scope,
    store: LocalStore<B>,
    config: SyncConfig,
    metrics: Arc<dyn SyncMetrics>,
    entries: Entries<B>,
}

impl<B: PersistenceBackend> RefreshCoordinator<B> {
    pub fn new(scope: Scope, store: LocalStore<B>) -> Self {
        RefreshCoordinator {
            scope,
            store,
            config: SyncConfig::default(),
            metrics: Arc::new(LogMetrics),
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn store(&self) -> &LocalStore<B> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Set the operation that refreshes `key`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `Error::ScopeEnded` after teardown.
    pub fn register<O: SyncOperation<B>>(&self, key: CacheKey, operation: O) -> Result<()> {
        self.register_arc(key, Arc::new(operation))
    }

    /// Like [`register`](Self::register), sharing one operation between keys.
    ///
    /// # Errors
    ///
    /// Returns `Error::ScopeEnded` after teardown.
    pub fn register_arc(&self, key: CacheKey, operation: Arc<dyn SyncOperation<B>>) -> Result<()> {
        self.scope.check()?;
        debug!("Registered refresh operation for {}", key);
        self.entries.entry(key).or_default().operation = Some(operation);
        Ok(())
    }

    pub fn is_registered(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.operation.is_some())
    }

    /// Snapshot of the key's refresh state. `None` before first access.
    pub fn state(&self, key: &CacheKey) -> Option<RefreshState> {
        self.entries.get(key).map(|entry| entry.state.clone())
    }

    /// Whether `refresh(key, strategy)` would start a fetch.
    ///
    /// With `IfStale` (`force = false`): true if the key was never fetched
    /// successfully, was invalidated by a sibling refresh, or has outlived the
    /// freshness policy.
    pub fn should_refresh(&self, key: &CacheKey, strategy: impl Into<RefreshStrategy>) -> bool {
        let strategy = strategy.into();
        match self.entries.get(key) {
            Some(entry) => self.is_stale(key, &entry.state, strategy),
            None => strategy != RefreshStrategy::CacheOnly,
        }
    }

    fn is_stale(&self, key: &CacheKey, state: &RefreshState, strategy: RefreshStrategy) -> bool {
        match strategy {
            RefreshStrategy::Force => true,
            RefreshStrategy::CacheOnly => false,
            RefreshStrategy::IfStale => match state.last_fetched_at {
                None => true,
                Some(_) if state.invalidated => true,
                Some(at) => self.config.freshness.is_expired(key, at),
            },
        }
    }

    /// Mark a key stale so the next `IfStale` refresh fetches.
    pub fn invalidate(&self, key: &CacheKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.state.invalidated = true;
        }
    }

    /// Refresh `key` if the strategy calls for it.
    ///
    /// Joins the in-flight fetch when there is one. The returned handle resolves
    /// to the same result for every caller attached to a generation. Errors
    /// (`NotRegistered`, `ScopeEnded`, fetch failures) are reported through
    /// the handle.
    ///
    /// # Panics
    ///
    /// Panics when a fetch has to start outside a Tokio runtime, since the
    /// fetch is spawned onto the current one.
    pub fn refresh(&self, key: &CacheKey, strategy: impl Into<RefreshStrategy>) -> RefreshHandle {
        let strategy = strategy.into();
        if let Err(e) = self.scope.check() {
            return RefreshHandle::ready(key.clone(), Err(e));
        }

        let mut entry = self.entries.entry(key.clone()).or_default();

        if let Some(in_flight) = &entry.in_flight {
            self.metrics.record_coalesced(key);
            return RefreshHandle {
                key: key.clone(),
                generation: Some(in_flight.generation),
                joined: true,
                result: in_flight.result.clone(),
                canceller: Some(self.canceller(key, in_flight.generation)),
            };
        }

        if !self.is_stale(key, &entry.state, strategy) {
            return RefreshHandle::ready(key.clone(), Ok(RefreshOutcome::Fresh));
        }

        let Some(operation) = entry.operation.clone() else {
            return RefreshHandle::ready(key.clone(), Err(Error::NotRegistered(key.to_string())));
        };

        entry.state.generation += 1;
        entry.state.in_flight = true;
        let generation = entry.state.generation;
        let cancel = Cancellation::new();

        debug!("Refreshing {} (generation {}, {})", key, generation, strategy);
        let job = RefreshJob {
            key: key.clone(),
            generation,
            ctx: SyncContext::new(
                key.clone(),
                self.store.clone(),
                cancel.clone(),
                self.config.max_pages,
                self.metrics.clone(),
            ),
            entries: self.entries.clone(),
            metrics: self.metrics.clone(),
        };
        let task = tokio::spawn(job.run(operation));

        let released = cancel.clone();
        let result = async move {
            tokio::select! {
                biased;
                _ = released.cancelled() => Err(Error::Cancelled),
                joined = task => joined.unwrap_or_else(|e| {
                    Err(Error::Persistence(format!("refresh task failed: {}", e)))
                }),
            }
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            generation,
            cancel,
            result: result.clone(),
        });
        drop(entry);

        RefreshHandle {
            key: key.clone(),
            generation: Some(generation),
            joined: false,
            result,
            canceller: Some(self.canceller(key, generation)),
        }
    }

    fn canceller(&self, key: &CacheKey, generation: u64) -> Canceller {
        let entries = self.entries.clone();
        let metrics = self.metrics.clone();
        let key = key.clone();
        Arc::new(move || cancel_generation(&entries, metrics.as_ref(), &key, Some(generation)))
    }

    /// Cancel the key's in-flight refresh. Its observers receive `Cancelled`;
    /// other keys are unaffected. Returns false when nothing was in flight.
    pub fn cancel(&self, key: &CacheKey) -> bool {
        cancel_generation(&self.entries, self.metrics.as_ref(), key, None)
    }

    /// Keys with a fetch in flight.
    pub fn in_flight(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| entry.in_flight.is_some())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// End the scope: cancel every in-flight refresh and drop all refresh state
    /// and registrations.
    pub fn teardown(&self) {
        self.scope.end();
        let keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for key in &keys {
            if cancel_generation(&self.entries, self.metrics.as_ref(), key, None) {
                cancelled += 1;
            }
        }
        self.entries.clear();
        warn!(
            "Refresh coordinator torn down ({} keys, {} in-flight cancelled)",
            keys.len(),
            cancelled
        );
    }
}

fn cancel_generation<B: PersistenceBackend>(
    entries: &DashMap<CacheKey, KeyEntry<B>>,
    metrics: &dyn SyncMetrics,
    key: &CacheKey,
    generation: Option<u64>,
) -> bool {
    let Some(mut entry) = entries.get_mut(key) else {
        return false;
    };
    let matches = match (&entry.in_flight, generation) {
        (Some(in_flight), Some(generation)) => in_flight.generation == generation,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if !matches {
        return false;
    }

    if let Some(in_flight) = entry.in_flight.take() {
        in_flight.cancel.cancel();
        entry.state.in_flight = false;
        debug!("Cancelled {} generation {}", key, in_flight.generation);
    }
    drop(entry);
    metrics.record_cancel(key);
    true
}

struct RefreshJob<B: PersistenceBackend> {
    key: CacheKey,
    generation: u64,
    ctx: SyncContext<B>,
    entries: Entries<B>,
    metrics: Arc<dyn SyncMetrics>,
}

impl<B: PersistenceBackend> RefreshJob<B> {
    async fn run(self, operation: Arc<dyn SyncOperation<B>>) -> Result<RefreshOutcome> {
        let ctx = &self.ctx;
        let result = AssertUnwindSafe(async move {
            let summary = operation.run(ctx).await?;
            ctx.commit(summary).await
        })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(Error::Persistence(format!(
                "refresh operation for {} panicked",
                self.key
            )))
        });
        self.finish(result)
    }

    fn finish(self, result: Result<SyncSummary>) -> Result<RefreshOutcome> {
        let Some(mut entry) = self.entries.get_mut(&self.key) else {
            debug!("Refresh of {} finished after teardown", self.key);
            return result.map(RefreshOutcome::Fetched);
        };
        let current = entry
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == self.generation);
        if !current {
            drop(entry);
            self.invalidate_siblings();
            debug!(
                "Discarding result of cancelled {} generation {}",
                self.key, self.generation
            );
            return Err(Error::Cancelled);
        }

        entry.in_flight = None;
        entry.state.in_flight = false;

        match result {
            Ok(summary) => {
                entry.state.last_fetched_at = Some(Instant::now());
                entry.state.last_error = None;
                entry.state.invalidated = false;
                drop(entry);

                let invalidated = self.invalidate_siblings();
                info!(
                    "✓ Refreshed {} ({} items, +{} -{}, {} sibling keys invalidated)",
                    self.key,
                    summary.items,
                    summary.persisted.upserted,
                    summary.persisted.removed,
                    invalidated
                );
                Ok(RefreshOutcome::Fetched(summary))
            }
            Err(Error::Cancelled) => {
                drop(entry);
                self.invalidate_siblings();
                self.metrics.record_cancel(&self.key);
                Err(Error::Cancelled)
            }
            Err(e) => {
                entry.state.last_error = Some(e.clone());
                drop(entry);
                // Incremental writes committed before the failure still count.
                self.invalidate_siblings();
                self.metrics.record_error(&self.key, &e.to_string());
                Err(e)
            }
        }
    }

    /// Mark every other key that lost records during this refresh as
    /// invalidated. Returns how many were marked.
    fn invalidate_siblings(&self) -> usize {
        let affected = self.ctx.affected_keys();
        for sibling in &affected {
            if let Some(mut other) = self.entries.get_mut(sibling) {
                other.state.invalidated = true;
            }
        }
        affected.len()
    }
}

type Canceller = Arc<dyn Fn() -> bool + Send + Sync>;

/// Completion of one `refresh` call.
///
/// Await it for the generation's terminal result. Dropping the handle does not
/// cancel the refresh.
#[must_use = "a RefreshHandle does nothing unless awaited or cancelled"]
pub struct RefreshHandle {
    key: CacheKey,
    generation: Option<u64>,
    joined: bool,
    result: SharedResult,
    canceller: Option<Canceller>,
}

impl RefreshHandle {
    fn ready(key: CacheKey, result: Result<RefreshOutcome>) -> Self {
        RefreshHandle {
            key,
            generation: None,
            joined: false,
            result: futures::future::ready(result).boxed().shared(),
            canceller: None,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Generation this handle observes. `None` when no fetch was involved.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Attached to a fetch another caller started.
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Cancel the generation this handle observes. Every observer of it
    /// receives `Cancelled`. Returns false if it already completed.
    pub fn cancel(&self) -> bool {
        self.canceller.as_ref().is_some_and(|cancel| cancel())
    }
}

impl Future for RefreshHandle {
    type Output = Result<RefreshOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.result.poll_unpin(cx)
    }
}

impl std::fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("joined", &self.joined)
            .finish()
    }
}
