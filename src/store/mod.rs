//! Local store: indexed, persistent collection of typed records.
//!
//! # Layout
//!
//! One table per resource type. Each table publishes immutable [`Snapshot`]s
//! through a `tokio::sync::watch` channel; every mutation builds a new snapshot,
//! writes it through the [`PersistenceBackend`], then swaps it in. Readers on
//! other threads therefore observe the pre- or post-mutation state, never a
//! half-applied one.
//!
//! # Single writer
//!
//! Mutations go through a [`StoreWriter`], which holds the store-wide write
//! lock for its lifetime. Writers are only handed out to sync operations by the
//! refresh coordinator; presentation code reads snapshots and live collections.
//!
//! # Notifications
//!
//! Every mutating call that changes something emits exactly one [`ChangeEvent`]
//! on the store's broadcast channel, after the write was applied. Subscribe per
//! resource type with [`LocalStore::on_change`].

use crate::backend::{InMemoryBackend, PersistenceBackend};
use crate::entity::Resource;
use crate::error::{Error, Result};
use crate::key::{CacheKey, CacheKeyBuilder};
use crate::query::Query;
use crate::serialization::decode_record;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

mod change;
mod snapshot;
mod writer;

pub use change::{ChangeEvent, ChangeKind, ChangeSubscription};
pub use snapshot::{Snapshot, StoredRecord};
pub use writer::{MutationSummary, StoreTransaction, StoreWriter};

/// Default capacity of the change broadcast channel.
pub const DEFAULT_CHANGE_BUFFER: usize = 64;

pub(crate) struct Table<R: Resource> {
    state: watch::Sender<Arc<Snapshot<R>>>,
}

impl<R: Resource> Table<R> {
    fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(Snapshot::empty()));
        Table { state }
    }

    pub(crate) fn current(&self) -> Arc<Snapshot<R>> {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<Snapshot<R>>> {
        self.state.subscribe()
    }

    /// Swap in a new record set. Callers hold the write lock.
    pub(crate) fn publish(
        &self,
        records: std::collections::HashMap<R::Id, Arc<StoredRecord<R>>>,
    ) -> u64 {
        let version = self.state.borrow().version + 1;
        self.state
            .send_replace(Arc::new(Snapshot { records, version }));
        version
    }
}

trait ErasedTable: Send + Sync {
    fn resource_type(&self) -> &'static str;
    fn len(&self) -> usize;
    /// Publish an empty snapshot. Returns `(version, removed)`.
    fn clear(&self) -> (u64, usize);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<R: Resource> ErasedTable for Table<R> {
    fn resource_type(&self) -> &'static str {
        R::resource_type()
    }

    fn len(&self) -> usize {
        self.state.borrow().len()
    }

    fn clear(&self) -> (u64, usize) {
        let removed = self.len();
        (self.publish(Default::default()), removed)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct StoreInner<B: PersistenceBackend> {
    backend: B,
    tables: DashMap<TypeId, Arc<dyn ErasedTable>>,
    changes: broadcast::Sender<ChangeEvent>,
    write_lock: Mutex<()>,
}

/// Persistent, indexed collection of typed records.
///
/// Cheap to clone; clones share the same tables and backend.
///
/// # Example
///
/// ```ignore
/// let store = LocalStore::new(InMemoryBackend::new());
/// store.hydrate::<Assignment>().await?;
///
/// let visible = store.query(&Query::<Assignment>::new().order_by_key(|a| a.position));
/// let mut changes = store.on_change("assignment");
/// ```
#[derive(Clone)]
pub struct LocalStore<B: PersistenceBackend = InMemoryBackend> {
    inner: Arc<StoreInner<B>>,
}

impl<B: PersistenceBackend> LocalStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_change_buffer(backend, DEFAULT_CHANGE_BUFFER)
    }

    /// Create a store whose change channel buffers `capacity` events per subscriber.
    pub fn with_change_buffer(backend: B, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        LocalStore {
            inner: Arc::new(StoreInner {
                backend,
                tables: DashMap::new(),
                changes,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub(crate) fn table<R: Resource>(&self) -> Arc<Table<R>> {
        let erased = self
            .inner
            .tables
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Arc::new(Table::<R>::new()) as Arc<dyn ErasedTable>)
            .value()
            .clone();
        match erased.as_any().downcast::<Table<R>>() {
            Ok(table) => table,
            // Keyed by TypeId, so the entry always holds a Table<R>.
            Err(_) => unreachable!("table registry entry does not match its TypeId"),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current snapshot of the `R` table.
    pub fn snapshot<R: Resource>(&self) -> Arc<Snapshot<R>> {
        self.table::<R>().current()
    }

    /// Filtered, ordered read-back.
    pub fn query<R: Resource>(&self, query: &Query<R>) -> Vec<R> {
        self.snapshot::<R>().query(query)
    }

    pub fn get<R: Resource>(&self, id: &R::Id) -> Option<R> {
        self.snapshot::<R>().get(id).cloned()
    }

    pub fn len<R: Resource>(&self) -> usize {
        self.snapshot::<R>().len()
    }

    /// Cache keys whose result sets contain the record.
    pub fn keys_of<R: Resource>(&self, id: &R::Id) -> BTreeSet<CacheKey> {
        self.snapshot::<R>()
            .stored(id)
            .map(|stored| stored.keys.clone())
            .unwrap_or_default()
    }

    /// Records in the result set of `key`, ordered by id.
    pub fn records_for_key<R: Resource>(&self, key: &CacheKey) -> Vec<R> {
        self.snapshot::<R>().records_for_key(key)
    }

    /// Watch the `R` table's snapshots. Used by live collections.
    pub fn subscribe<R: Resource>(&self) -> watch::Receiver<Arc<Snapshot<R>>> {
        self.table::<R>().subscribe()
    }

    /// Change notifications for one resource type.
    pub fn on_change(&self, resource_type: &str) -> ChangeSubscription {
        ChangeSubscription::new(resource_type, self.inner.changes.subscribe())
    }

    /// Resource types with at least one table, and their record counts.
    pub fn table_sizes(&self) -> Vec<(&'static str, usize)> {
        let mut sizes: Vec<_> = self
            .inner
            .tables
            .iter()
            .map(|entry| (entry.value().resource_type(), entry.value().len()))
            .collect();
        sizes.sort();
        sizes
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Acquire the store-wide write lock.
    pub(crate) async fn writer(&self) -> StoreWriter<'_, B> {
        let guard = self.inner.write_lock.lock().await;
        StoreWriter::new(self, guard)
    }

    pub(crate) fn notify(&self, event: ChangeEvent) {
        debug!(
            "Store change {:?} on {} (v{}, +{} -{})",
            event.kind, event.resource_type, event.version, event.upserted, event.removed
        );
        // No subscribers is not an error.
        let _ = self.inner.changes.send(event);
    }

    /// Load persisted `R` records into the table.
    ///
    /// Records already in memory win over persisted copies. Entries that fail to
    /// decode (corruption, old schema version) are skipped and left for the next
    /// refresh to overwrite. Emits a single `Hydrate` notification.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the backend scan fails.
    pub async fn hydrate<R: Resource>(&self) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        let table = self.table::<R>();
        let prefix = CacheKeyBuilder::prefix::<R>();
        let entries = self
            .inner
            .backend
            .scan_prefix(&prefix)
            .await
            .map_err(into_persistence)?;

        let mut records = table.current().records.clone();
        let mut loaded = 0;
        for (key, bytes) in entries {
            match decode_record::<StoredRecord<R>>(&bytes) {
                Ok(stored) => {
                    let id = stored.record.id();
                    if !records.contains_key(&id) {
                        records.insert(id, Arc::new(stored));
                        loaded += 1;
                    }
                }
                Err(e) => warn!("Skipping persisted record {}: {}", key, e),
            }
        }

        if loaded > 0 {
            let version = table.publish(records);
            self.notify(ChangeEvent {
                resource_type: R::resource_type(),
                kind: ChangeKind::Hydrate,
                version,
                upserted: loaded,
                removed: 0,
            });
        }
        info!("✓ Hydrated {} {} records", loaded, R::resource_type());
        Ok(loaded)
    }

    /// Remove every record from every table and from the backend.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the backend cannot be cleared; tables are
    /// left untouched in that case.
    pub async fn purge(&self) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        self.inner
            .backend
            .clear_all()
            .await
            .map_err(into_persistence)?;

        let tables: Vec<Arc<dyn ErasedTable>> = self
            .inner
            .tables
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for table in tables {
            let (version, removed) = table.clear();
            self.notify(ChangeEvent {
                resource_type: table.resource_type(),
                kind: ChangeKind::Purge,
                version,
                upserted: 0,
                removed,
            });
        }
        warn!("⚠ Local store purged");
        Ok(())
    }
}

pub(crate) fn into_persistence(e: Error) -> Error {
    match e {
        Error::Persistence(_) => e,
        other => Error::Persistence(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PersistenceBackend;
    use crate::serialization::encode_record;
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
        pos: u32,
    }

    impl Resource for Item {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }

        fn resource_type() -> &'static str {
            "item"
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Other {
        id: u32,
    }

    impl Resource for Other {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }

        fn resource_type() -> &'static str {
            "other"
        }
    }

    fn item(id: u32, pos: u32) -> Item {
        Item { id, pos }
    }

    fn key(raw: &str) -> CacheKey {
        CacheKey::from_raw(raw)
    }

    fn ids(items: &[Item]) -> Vec<u32> {
        items.iter().map(|i| i.id).collect()
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_identity() {
        let store = LocalStore::new(InMemoryBackend::new());
        {
            let mut writer = store.writer().await;
            writer
                .upsert(vec![item(1, 1), item(2, 2)], None)
                .await
                .expect("Failed to upsert");
            writer
                .upsert(vec![item(1, 5)], None)
                .await
                .expect("Failed to upsert");
        }

        assert_eq!(store.len::<Item>(), 2);
        assert_eq!(store.get::<Item>(&1), Some(item(1, 5)));
        assert_eq!(store.backend().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_one_batch_keep_last() {
        let store = LocalStore::new(InMemoryBackend::new());
        let mut writer = store.writer().await;
        writer
            .upsert(vec![item(1, 1), item(1, 2)], None)
            .await
            .expect("Failed to upsert");
        drop(writer);

        assert_eq!(store.len::<Item>(), 1);
        assert_eq!(store.get::<Item>(&1), Some(item(1, 2)));
    }

    #[tokio::test]
    async fn test_query_orders_records() {
        let store = LocalStore::new(InMemoryBackend::new());
        store
            .writer()
            .await
            .upsert(vec![item(1, 2), item(2, 1)], None)
            .await
            .expect("Failed to upsert");

        let ordered = store.query(&Query::<Item>::new().order_by_key(|i| i.pos));
        assert_eq!(ids(&ordered), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_one_notification_per_call() {
        let store = LocalStore::new(InMemoryBackend::new());
        let mut changes = store.on_change("item");

        store
            .writer()
            .await
            .upsert(vec![item(1, 1), item(2, 2), item(3, 3)], None)
            .await
            .expect("Failed to upsert");

        let event = changes.try_recv().expect("expected one event");
        assert_eq!(event.kind, ChangeKind::Upsert);
        assert_eq!(event.upserted, 3);
        assert!(changes.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_notifications_filtered_by_resource_type() {
        let store = LocalStore::new(InMemoryBackend::new());
        let mut changes = store.on_change("item");

        store
            .writer()
            .await
            .upsert(vec![Other { id: 1 }], None)
            .await
            .expect("Failed to upsert");
        assert!(changes.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unchanged_upsert_is_silent() {
        let store = LocalStore::new(InMemoryBackend::new());
        store
            .writer()
            .await
            .upsert(vec![item(1, 1)], None)
            .await
            .expect("Failed to upsert");
        let version = store.snapshot::<Item>().version();
        let mut changes = store.on_change("item");

        let summary = store
            .writer()
            .await
            .upsert(vec![item(1, 1)], None)
            .await
            .expect("Failed to upsert");

        assert_eq!(summary.unchanged, 1);
        assert_eq!(store.snapshot::<Item>().version(), version);
        assert!(changes.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_delete_by_predicate() {
        let store = LocalStore::new(InMemoryBackend::new());
        let mut writer = store.writer().await;
        writer
            .upsert(vec![item(1, 1), item(2, 2), item(3, 3)], None)
            .await
            .expect("Failed to upsert");
        let summary = writer
            .delete::<Item, _>(|i| i.pos >= 2)
            .await
            .expect("Failed to delete");
        drop(writer);

        assert_eq!(summary.removed, 2);
        assert_eq!(ids(&store.query(&Query::<Item>::new())), vec![1]);
        assert_eq!(store.backend().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_for_key_is_server_authoritative() {
        let store = LocalStore::new(InMemoryBackend::new());
        let k1 = key("item?gp=1");
        let mut writer = store.writer().await;
        writer
            .replace_for_key(&k1, vec![item(1, 2), item(2, 1)])
            .await
            .expect("Failed to replace");
        let summary = writer
            .replace_for_key(&k1, vec![item(2, 1), item(3, 0)])
            .await
            .expect("Failed to replace");
        drop(writer);

        assert_eq!(summary.removed, 1);
        assert_eq!(ids(&store.records_for_key::<Item>(&k1)), vec![2, 3]);
        assert!(store.get::<Item>(&1).is_none());
    }

    #[tokio::test]
    async fn test_replace_keeps_records_shared_with_other_keys() {
        let store = LocalStore::new(InMemoryBackend::new());
        let k1 = key("item?gp=1");
        let k2 = key("item?gp=2");
        let mut writer = store.writer().await;
        writer
            .replace_for_key(&k1, vec![item(1, 1), item(2, 2)])
            .await
            .expect("Failed to replace");
        writer
            .replace_for_key(&k2, vec![item(2, 2), item(3, 3)])
            .await
            .expect("Failed to replace");
        writer
            .replace_for_key(&k1, vec![item(1, 1)])
            .await
            .expect("Failed to replace");
        drop(writer);

        // Item 2 left k1 but is still in k2's result set.
        assert_eq!(store.keys_of::<Item>(&2), [k2.clone()].into_iter().collect());
        assert_eq!(ids(&store.records_for_key::<Item>(&k2)), vec![2, 3]);
        assert_eq!(ids(&store.records_for_key::<Item>(&k1)), vec![1]);
    }

    #[tokio::test]
    async fn test_invalidate_excludes_own_key_and_reports_siblings() {
        let store = LocalStore::new(InMemoryBackend::new());
        let k1 = key("item?gp=1");
        let k2 = key("item?gp=2");
        let mut writer = store.writer().await;
        writer
            .replace_for_key(&k1, vec![item(1, 1)])
            .await
            .expect("Failed to replace");
        writer
            .replace_for_key(&k2, vec![item(2, 2)])
            .await
            .expect("Failed to replace");

        let summary = writer
            .invalidate::<Item, _>(|_| true, &k1)
            .await
            .expect("Failed to invalidate");
        drop(writer);

        assert_eq!(summary.removed, 1);
        assert!(summary.affected_keys.contains(&k2));
        assert!(!summary.affected_keys.contains(&k1));
        assert_eq!(ids(&store.query(&Query::<Item>::new())), vec![1]);
    }

    #[tokio::test]
    async fn test_retain_for_key() {
        let store = LocalStore::new(InMemoryBackend::new());
        let k1 = key("item");
        let mut writer = store.writer().await;
        writer
            .upsert(vec![item(1, 1), item(2, 2), item(3, 3)], Some(&k1))
            .await
            .expect("Failed to upsert");
        let keep: HashSet<u32> = [1, 3].into_iter().collect();
        writer
            .retain_for_key::<Item>(&k1, &keep)
            .await
            .expect("Failed to retain");
        drop(writer);

        assert_eq!(ids(&store.records_for_key::<Item>(&k1)), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_transaction_commits_once() {
        let store = LocalStore::new(InMemoryBackend::new());
        let k1 = key("item?gp=1");
        let k2 = key("item?gp=2");
        store
            .writer()
            .await
            .replace_for_key(&k1, vec![item(1, 1)])
            .await
            .expect("Failed to replace");
        let mut items = store.on_change("item");
        let mut others = store.on_change("other");

        let mut writer = store.writer().await;
        let mut tx = writer.transaction();
        tx.invalidate::<Item, _>(|_| true, &k2);
        tx.replace_for_key(&k2, vec![item(2, 2)])
            .expect("Failed to stage");
        tx.upsert(vec![Other { id: 5 }], None)
            .expect("Failed to stage");
        assert_eq!(store.len::<Other>(), 0);
        assert_eq!(ids(&store.query(&Query::<Item>::new())), vec![1]);

        let summary = tx.commit().await.expect("Failed to commit");
        drop(writer);

        assert_eq!(summary.removed, 1);
        assert_eq!(summary.upserted, 2);
        assert!(summary.affected_keys.contains(&k1));
        assert_eq!(ids(&store.query(&Query::<Item>::new())), vec![2]);
        assert_eq!(store.len::<Other>(), 1);

        let event = items.try_recv().expect("expected one item event");
        assert_eq!(event.kind, ChangeKind::Replace);
        assert_eq!((event.upserted, event.removed), (1, 1));
        assert!(items.try_recv().is_none());
        assert_eq!(others.try_recv().map(|e| e.kind), Some(ChangeKind::Upsert));
    }

    #[tokio::test]
    async fn test_dropped_transaction_changes_nothing() {
        let store = LocalStore::new(InMemoryBackend::new());
        let mut changes = store.on_change("item");
        let version = store.snapshot::<Item>().version();

        let mut writer = store.writer().await;
        let mut tx = writer.transaction();
        tx.upsert(vec![item(1, 1)], None).expect("Failed to stage");
        assert_eq!(tx.summary().upserted, 1);
        drop(tx);
        drop(writer);

        assert_eq!(store.len::<Item>(), 0);
        assert_eq!(store.snapshot::<Item>().version(), version);
        assert!(store.backend().is_empty());
        assert!(changes.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_reader_sees_whole_mutation() {
        let store = LocalStore::new(InMemoryBackend::new());
        let before = store.snapshot::<Item>();
        store
            .writer()
            .await
            .upsert(vec![item(1, 1), item(2, 2)], None)
            .await
            .expect("Failed to upsert");

        assert_eq!(before.len(), 0);
        assert_eq!(store.snapshot::<Item>().len(), 2);
    }

    #[tokio::test]
    async fn test_hydrate_from_backend() {
        let backend = InMemoryBackend::new();
        let stored = StoredRecord {
            record: item(7, 1),
            keys: [key("item")].into_iter().collect(),
        };
        backend
            .set("item:7", encode_record(&stored).expect("Failed to encode"))
            .await
            .expect("Failed to set");
        backend
            .set("item:8", b"garbage".to_vec())
            .await
            .expect("Failed to set");

        let store = LocalStore::new(backend);
        let mut changes = store.on_change("item");
        let loaded = store.hydrate::<Item>().await.expect("Failed to hydrate");

        assert_eq!(loaded, 1);
        assert_eq!(store.get::<Item>(&7), Some(item(7, 1)));
        assert_eq!(store.keys_of::<Item>(&7).len(), 1);
        assert_eq!(
            changes.try_recv().map(|e| e.kind),
            Some(ChangeKind::Hydrate)
        );
    }

    #[tokio::test]
    async fn test_purge() {
        let store = LocalStore::new(InMemoryBackend::new());
        store
            .writer()
            .await
            .upsert(vec![item(1, 1)], None)
            .await
            .expect("Failed to upsert");
        store
            .writer()
            .await
            .upsert(vec![Other { id: 1 }], None)
            .await
            .expect("Failed to upsert");

        store.purge().await.expect("Failed to purge");

        assert_eq!(store.len::<Item>(), 0);
        assert_eq!(store.len::<Other>(), 0);
        assert!(store.backend().is_empty());
        assert_eq!(store.table_sizes(), vec![("item", 0), ("other", 0)]);
    }
}
