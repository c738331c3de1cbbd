//! Fetch-and-persist operations driven by the refresh coordinator.
//!
//! A [`SyncOperation`] is registered per cache key. When the coordinator decides
//! the key needs a refresh it runs the operation with a [`SyncContext`], which
//! carries the key, the cancellation token of the current generation and the
//! only route to the store's writer.
//!
//! Operations fetch first and stage their writes with [`SyncContext::stage`].
//! The coordinator commits everything staged during a refresh as one store
//! transaction, and only once the operation returned `Ok`. A refresh that fails
//! anywhere, including in one branch of a [`CompositeSync`], leaves the store
//! untouched.
//!
//! [`CollectionSync`] covers the common case: drain one paginated endpoint and
//! make the result the key's server-authoritative record set.
//!
//! ```ignore
//! let op = CollectionSync::<Assignment, _>::new(
//!     transport.clone(),
//!     PageRequest::new("courses/1/assignments").with_param("grading_period_id", "2"),
//! )
//! .invalidating(Invalidation::context("course_1"));
//!
//! coordinator.register(key, op);
//! ```

use crate::backend::PersistenceBackend;
use crate::cancel::Cancellation;
use crate::entity::Resource;
use crate::error::Result;
use crate::key::CacheKey;
use crate::observability::SyncMetrics;
use crate::paginate::Paginator;
use crate::store::{LocalStore, MutationSummary, StoreTransaction, StoreWriter};
use crate::transport::{PageRequest, Transport};
use dashmap::DashSet;
use futures::future::{try_join_all, BoxFuture};
use std::collections::{BTreeSet, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

type StagedWrite<B> = Box<dyn for<'t> FnOnce(&mut StoreTransaction<'t, B>) -> Result<()> + Send>;

/// Totals reported by one operation run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub pages: usize,
    pub items: usize,
    pub persisted: MutationSummary,
}

impl SyncSummary {
    pub fn merge(&mut self, other: SyncSummary) {
        self.pages += other.pages;
        self.items += other.items;
        self.persisted.merge(other.persisted);
    }
}

/// Everything an operation may touch during one refresh.
#[derive(Clone)]
pub struct SyncContext<B: PersistenceBackend> {
    key: CacheKey,
    store: LocalStore<B>,
    cancel: Cancellation,
    max_pages: usize,
    metrics: Arc<dyn SyncMetrics>,
    affected: Arc<DashSet<CacheKey>>,
    staged_tx: mpsc::UnboundedSender<StagedWrite<B>>,
    staged_rx: Arc<Mutex<mpsc::UnboundedReceiver<StagedWrite<B>>>>,
}

impl<B: PersistenceBackend> SyncContext<B> {
    pub(crate) fn new(
        key: CacheKey,
        store: LocalStore<B>,
        cancel: Cancellation,
        max_pages: usize,
        metrics: Arc<dyn SyncMetrics>,
    ) -> Self {
        let (staged_tx, staged_rx) = mpsc::unbounded_channel();
        SyncContext {
            key,
            store,
            cancel,
            max_pages,
            metrics,
            affected: Arc::new(DashSet::new()),
            staged_tx,
            staged_rx: Arc::new(Mutex::new(staged_rx)),
        }
    }

    /// The key being refreshed.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Read access to the store.
    pub fn store(&self) -> &LocalStore<B> {
        &self.store
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// A paginator bound to this refresh's cancellation and page cap.
    pub fn paginator<'t, T: Transport>(
        &self,
        transport: &'t T,
        request: PageRequest,
    ) -> Paginator<'t, T> {
        Paginator::new(transport, request)
            .with_max_pages(self.max_pages)
            .with_cancellation(self.cancel.clone())
    }

    /// Queue a write for the end of the refresh.
    ///
    /// Staged writes run in order inside one [`StoreTransaction`] after the
    /// operation succeeded. A failed or cancelled refresh discards them.
    pub fn stage<F>(&self, write: F)
    where
        F: for<'t> FnOnce(&mut StoreTransaction<'t, B>) -> Result<()> + Send + 'static,
    {
        // The receiver lives as long as the context.
        let _ = self.staged_tx.send(Box::new(write));
    }

    /// Commit every staged write as one transaction.
    ///
    /// The persisted totals are merged into `summary`.
    pub(crate) async fn commit(&self, mut summary: SyncSummary) -> Result<SyncSummary> {
        let mut staged = Vec::new();
        {
            let mut rx = self.staged_rx.lock().await;
            while let Ok(write) = rx.try_recv() {
                staged.push(write);
            }
        }
        if staged.is_empty() {
            return Ok(summary);
        }

        let mut writer = self.writer().await?;
        let mut tx = writer.transaction();
        for write in staged {
            write(&mut tx)?;
        }
        let persisted = tx.commit().await?;
        self.record(&persisted);
        summary.persisted.merge(persisted);
        Ok(summary)
    }

    /// Acquire the store writer for immediate writes.
    ///
    /// Writes made through it are visible before the refresh completes and
    /// survive its failure; incremental persistence uses it. Fails with
    /// `Cancelled` if the refresh was cancelled while waiting, so a cancelled
    /// generation never writes.
    pub async fn writer(&self) -> Result<StoreWriter<'_, B>> {
        self.cancel.check()?;
        let writer = self.store.writer().await;
        self.cancel.check()?;
        Ok(writer)
    }

    /// Report a mutation. Other keys that lost records get marked invalidated
    /// once the refresh succeeds.
    pub fn record(&self, summary: &MutationSummary) {
        for key in &summary.affected_keys {
            if *key != self.key {
                self.affected.insert(key.clone());
            }
        }
        if !summary.is_empty() {
            self.metrics
                .record_persist(&self.key, summary.upserted, summary.removed);
        }
    }

    pub(crate) fn affected_keys(&self) -> BTreeSet<CacheKey> {
        self.affected.iter().map(|k| k.key().clone()).collect()
    }
}

/// One fetch-and-persist step for a cache key.
///
/// Implement directly for dependent fetches (e.g. modules, then the items of
/// each module).
pub trait SyncOperation<B: PersistenceBackend>: Send + Sync + 'static {
    fn run<'a>(&'a self, ctx: &'a SyncContext<B>) -> BoxFuture<'a, Result<SyncSummary>>;
}

/// Which stored records a refresh invalidates in sibling keys.
///
/// Applied before the refreshed records are persisted, to stored records of the
/// same type that are not members of the refreshing key.
pub struct Invalidation<R: Resource> {
    predicate: Arc<dyn Fn(&R) -> bool + Send + Sync>,
}

impl<R: Resource> Invalidation<R> {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        Invalidation {
            predicate: Arc::new(predicate),
        }
    }

    /// Every record under the same parent context.
    pub fn context(context_id: impl Into<String>) -> Self {
        let context_id = context_id.into();
        Invalidation::new(move |r: &R| r.context_id().as_deref() == Some(context_id.as_str()))
    }

    pub fn matches(&self, record: &R) -> bool {
        (self.predicate)(record)
    }
}

impl<R: Resource> Clone for Invalidation<R> {
    fn clone(&self) -> Self {
        Invalidation {
            predicate: self.predicate.clone(),
        }
    }
}

/// Drain one paginated endpoint into the key's record set.
pub struct CollectionSync<R: Resource, T: Transport> {
    transport: T,
    request: PageRequest,
    invalidation: Option<Invalidation<R>>,
    incremental: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Resource, T: Transport> CollectionSync<R, T> {
    pub fn new(transport: T, request: PageRequest) -> Self {
        CollectionSync {
            transport,
            request,
            invalidation: None,
            incremental: false,
            _marker: PhantomData,
        }
    }

    pub fn invalidating(mut self, invalidation: Invalidation<R>) -> Self {
        self.invalidation = Some(invalidation);
        self
    }

    /// Persist each page as it arrives instead of after the full drain.
    ///
    /// Records that left the key's set are only removed after the last page. A
    /// failed or cancelled drain keeps the pages persisted so far.
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    async fn run_batched<B: PersistenceBackend>(&self, ctx: &SyncContext<B>) -> Result<SyncSummary> {
        let paginator = ctx.paginator(&self.transport, self.request.clone());
        let mut cursor = paginator.cursor::<R>();
        let mut records = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            records.extend(page);
        }
        for record in &records {
            record.validate()?;
        }

        let summary = SyncSummary {
            pages: cursor.pages(),
            items: records.len(),
            ..SyncSummary::default()
        };

        let key = ctx.key().clone();
        let invalidation = self.invalidation.clone();
        ctx.stage(move |tx| {
            if let Some(invalidation) = invalidation {
                tx.invalidate::<R, _>(|r| invalidation.matches(r), &key);
            }
            tx.replace_for_key(&key, records)?;
            Ok(())
        });
        Ok(summary)
    }

    async fn run_incremental<B: PersistenceBackend>(
        &self,
        ctx: &SyncContext<B>,
    ) -> Result<SyncSummary> {
        let paginator = ctx.paginator(&self.transport, self.request.clone());
        let mut cursor = paginator.cursor::<R>();
        let mut seen: HashSet<R::Id> = HashSet::new();
        let mut summary = SyncSummary::default();

        if let Some(invalidation) = &self.invalidation {
            let mut writer = ctx.writer().await?;
            let invalidated = writer
                .invalidate::<R, _>(|r| invalidation.matches(r), ctx.key())
                .await?;
            ctx.record(&invalidated);
            summary.persisted.merge(invalidated);
        }

        while let Some(page) = cursor.next_page().await? {
            for record in &page {
                record.validate()?;
            }
            summary.items += page.len();
            seen.extend(page.iter().map(Resource::id));

            let mut writer = ctx.writer().await?;
            let upserted = writer.upsert(page, Some(ctx.key())).await?;
            ctx.record(&upserted);
            summary.persisted.merge(upserted);
        }
        summary.pages = cursor.pages();

        let mut writer = ctx.writer().await?;
        let retained = writer.retain_for_key::<R>(ctx.key(), &seen).await?;
        ctx.record(&retained);
        summary.persisted.merge(retained);
        Ok(summary)
    }
}

impl<R, T, B> SyncOperation<B> for CollectionSync<R, T>
where
    R: Resource,
    T: Transport,
    B: PersistenceBackend,
{
    fn run<'a>(&'a self, ctx: &'a SyncContext<B>) -> BoxFuture<'a, Result<SyncSummary>> {
        Box::pin(async move {
            let started = Instant::now();
            let summary = if self.incremental {
                self.run_incremental(ctx).await?
            } else {
                self.run_batched(ctx).await?
            };
            ctx.metrics
                .record_fetch(ctx.key(), summary.pages, summary.items, started.elapsed());
            Ok(summary)
        })
    }
}

/// Several operations refreshed together under one key.
///
/// They run concurrently; the first error fails the refresh. Their staged
/// writes commit together, so either every operation's records land or none
/// do. Incremental operations persist as they go even inside a composite.
pub struct CompositeSync<B: PersistenceBackend> {
    operations: Vec<Arc<dyn SyncOperation<B>>>,
}

impl<B: PersistenceBackend> CompositeSync<B> {
    pub fn new() -> Self {
        CompositeSync {
            operations: Vec::new(),
        }
    }

    pub fn with<O: SyncOperation<B>>(mut self, operation: O) -> Self {
        self.operations.push(Arc::new(operation));
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl<B: PersistenceBackend> Default for CompositeSync<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: PersistenceBackend> SyncOperation<B> for CompositeSync<B> {
    fn run<'a>(&'a self, ctx: &'a SyncContext<B>) -> BoxFuture<'a, Result<SyncSummary>> {
        Box::pin(async move {
            let results = try_join_all(self.operations.iter().map(|op| op.run(ctx))).await?;
            let mut summary = SyncSummary::default();
            for result in results {
                summary.merge(result);
            }
            Ok(summary)
        })
    }
}
