//! High-level sync service for client applications.
//!
//! Bundles the local store, the refresh coordinator and the session scope
//! behind one `Arc`-shared handle.

use crate::backend::{InMemoryBackend, PersistenceBackend};
use crate::config::SyncConfig;
use crate::coordinator::{RefreshCoordinator, RefreshHandle, RefreshState};
use crate::entity::Resource;
use crate::error::Result;
use crate::key::CacheKey;
use crate::live::{LiveCollection, LiveSections, Query};
use crate::observability::SyncMetrics;
use crate::operation::SyncOperation;
use crate::scope::Scope;
use crate::store::LocalStore;
use crate::strategy::RefreshStrategy;
use std::sync::Arc;

/// Entry point for presentation code.
///
/// Cheap to clone; clones share the same store, coordinator and scope.
///
/// # Example
///
/// ```ignore
/// use sync_kit::{SyncService, Scope, CollectionSync, Query, RefreshStrategy};
/// use sync_kit::backend::InMemoryBackend;
///
/// let sync = SyncService::new(Scope::new("user_1"), InMemoryBackend::new());
///
/// let key = CacheKeyBuilder::for_resource::<Assignment>(
///     Some("course_1"),
///     &KeyParams::new().with("grading_period_id", "2"),
/// );
/// sync.register(key.clone(), CollectionSync::<Assignment, _>::new(transport, request))?;
///
/// // Starts a refresh if the key is stale, and returns the view immediately.
/// let mut assignments = sync.live_collection(
///     &key,
///     Query::new().order_by_key(|a: &Assignment| a.position),
/// );
///
/// // Pull to refresh
/// sync.refresh(&key, RefreshStrategy::Force).await?;
///
/// // Session end
/// sync.logout().await?;
/// ```
#[derive(Clone)]
pub struct SyncService<B: PersistenceBackend = InMemoryBackend> {
    coordinator: Arc<RefreshCoordinator<B>>,
}

impl<B: PersistenceBackend> SyncService<B> {
    /// Create a service with default configuration.
    pub fn new(scope: Scope, backend: B) -> Self {
        let store = LocalStore::new(backend);
        SyncService {
            coordinator: Arc::new(RefreshCoordinator::new(scope, store)),
        }
    }

    /// Create a service with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn with_config(scope: Scope, backend: B, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let store = LocalStore::with_change_buffer(backend, config.change_buffer);
        Ok(SyncService {
            coordinator: Arc::new(RefreshCoordinator::new(scope, store).with_config(config)),
        })
    }

    /// Replace the metrics hooks.
    pub fn with_metrics(self, metrics: Arc<dyn SyncMetrics>) -> Self {
        let coordinator = (*self.coordinator).clone().with_metrics(metrics);
        SyncService {
            coordinator: Arc::new(coordinator),
        }
    }

    pub fn store(&self) -> &LocalStore<B> {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator<B> {
        &self.coordinator
    }

    pub fn scope(&self) -> &Scope {
        self.coordinator.scope()
    }

    /// Set the operation that refreshes `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ScopeEnded` after logout.
    pub fn register<O: SyncOperation<B>>(&self, key: CacheKey, operation: O) -> Result<()> {
        self.coordinator.register(key, operation)
    }

    /// Refresh `key`. See [`RefreshCoordinator::refresh`].
    pub fn refresh(&self, key: &CacheKey, strategy: impl Into<RefreshStrategy>) -> RefreshHandle {
        self.coordinator.refresh(key, strategy)
    }

    pub fn state(&self, key: &CacheKey) -> Option<RefreshState> {
        self.coordinator.state(key)
    }

    /// Live view of `key`'s records, filtered and ordered by `query`.
    ///
    /// Starts an `IfStale` refresh in the background; the view follows the store
    /// as results land. Refresh errors are reported through the metrics hooks
    /// and [`SyncService::state`].
    ///
    /// # Panics
    ///
    /// Panics outside a Tokio runtime when `key` is registered and stale: the
    /// background refresh spawns onto the current runtime.
    pub fn live_collection<R: Resource>(&self, key: &CacheKey, query: Query<R>) -> LiveCollection<R> {
        let live = LiveCollection::new(self.store(), query.member_of(key.clone()));
        if self.coordinator.is_registered(key) {
            drop(self.refresh(key, RefreshStrategy::IfStale));
        }
        live
    }

    /// Sectioned live view of `key`'s records. Collapsed sections are
    /// remembered by the scope under the key.
    ///
    /// # Panics
    ///
    /// Same as [`SyncService::live_collection`].
    pub fn live_sections<R, F>(&self, key: &CacheKey, query: Query<R>, section_of: F) -> LiveSections<R>
    where
        R: Resource,
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        let visibility = self.scope().section_visibility(key.as_str());
        LiveSections::new(self.live_collection(key, query), section_of, visibility)
    }

    /// Load persisted `R` records into the store.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the backend scan fails.
    pub async fn hydrate<R: Resource>(&self) -> Result<usize> {
        self.store().hydrate::<R>().await
    }

    /// End the session: cancel in-flight refreshes, drop refresh state, and
    /// purge the store and its persistence.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the backend cannot be cleared.
    pub async fn logout(&self) -> Result<()> {
        self.coordinator.teardown();
        self.store().purge().await
    }
}
