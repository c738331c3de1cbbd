//! Serialized store mutations.

use super::{into_persistence, ChangeEvent, ChangeKind, LocalStore, StoredRecord, Table};
use crate::backend::{PersistenceBackend, WriteBatch};
use crate::entity::Resource;
use crate::error::Result;
use crate::key::CacheKey;
use crate::serialization::encode_record;
use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::MutexGuard;

type Records<R> = HashMap<<R as Resource>::Id, Arc<StoredRecord<R>>>;

/// What one mutation changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationSummary {
    pub upserted: usize,
    pub removed: usize,
    /// Incoming records identical to the stored copy.
    pub unchanged: usize,
    /// Cache keys that lost at least one member record.
    pub affected_keys: BTreeSet<CacheKey>,
}

impl MutationSummary {
    pub fn is_empty(&self) -> bool {
        self.upserted == 0 && self.removed == 0
    }

    pub fn merge(&mut self, other: MutationSummary) {
        self.upserted += other.upserted;
        self.removed += other.removed;
        self.unchanged += other.unchanged;
        self.affected_keys.extend(other.affected_keys);
    }
}

/// Exclusive write access to a [`LocalStore`].
///
/// Each method is one mutation: the new record set is written through the
/// backend first and only published (and announced with a single
/// [`ChangeEvent`]) once the backend accepted it. On a backend error the
/// table is left exactly as it was. Use [`StoreWriter::transaction`] to apply
/// several mutations as one.
pub struct StoreWriter<'a, B: PersistenceBackend> {
    store: &'a LocalStore<B>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a, B: PersistenceBackend> StoreWriter<'a, B> {
    pub(crate) fn new(store: &'a LocalStore<B>, guard: MutexGuard<'a, ()>) -> Self {
        StoreWriter {
            store,
            _guard: guard,
        }
    }

    pub fn store(&self) -> &LocalStore<B> {
        self.store
    }

    /// Start staging mutations that commit together.
    pub fn transaction(&mut self) -> StoreTransaction<'_, B> {
        StoreTransaction {
            store: self.store,
            tables: Vec::new(),
            batch: WriteBatch::new(),
            summary: MutationSummary::default(),
        }
    }

    /// Insert or replace records by identity.
    ///
    /// With `key`, the records also join that key's result set. Later duplicates
    /// within `records` win.
    pub async fn upsert<R: Resource>(
        &mut self,
        records: Vec<R>,
        key: Option<&CacheKey>,
    ) -> Result<MutationSummary> {
        let mut tx = self.transaction();
        tx.upsert(records, key)?;
        tx.commit().await
    }

    /// Remove every record matching `predicate`.
    pub async fn delete<R, F>(&mut self, predicate: F) -> Result<MutationSummary>
    where
        R: Resource,
        F: Fn(&R) -> bool,
    {
        let mut tx = self.transaction();
        tx.delete(predicate);
        tx.commit().await
    }

    /// Cross-key invalidation. See [`StoreTransaction::invalidate`].
    pub async fn invalidate<R, F>(
        &mut self,
        predicate: F,
        excluding: &CacheKey,
    ) -> Result<MutationSummary>
    where
        R: Resource,
        F: Fn(&R) -> bool,
    {
        let mut tx = self.transaction();
        tx.invalidate(predicate, excluding);
        tx.commit().await
    }

    /// Make `records` the complete result set of `key`.
    /// See [`StoreTransaction::replace_for_key`].
    pub async fn replace_for_key<R: Resource>(
        &mut self,
        key: &CacheKey,
        records: Vec<R>,
    ) -> Result<MutationSummary> {
        let mut tx = self.transaction();
        tx.replace_for_key(key, records)?;
        tx.commit().await
    }

    /// Drop from `key`'s result set every member not in `keep`.
    ///
    /// Closes an incremental refresh, whose pages were upserted one at a time.
    pub async fn retain_for_key<R: Resource>(
        &mut self,
        key: &CacheKey,
        keep: &HashSet<R::Id>,
    ) -> Result<MutationSummary> {
        let mut tx = self.transaction();
        tx.retain_for_key::<R>(key, keep)?;
        tx.commit().await
    }
}

/// Mutations staged against one or more tables, committed as a single backend
/// batch.
///
/// Staging touches neither the backend nor the published snapshots.
/// [`StoreTransaction::commit`] applies the whole batch, then publishes every
/// touched table and emits one [`ChangeEvent`] per table. Dropping a
/// transaction, or committing one whose batch the backend rejects, leaves the
/// store as it was.
///
/// A staging call that fails may have staged part of its records; drop the
/// transaction when that happens.
pub struct StoreTransaction<'w, B: PersistenceBackend> {
    store: &'w LocalStore<B>,
    tables: Vec<(TypeId, Box<dyn StagedTable>)>,
    batch: WriteBatch,
    summary: MutationSummary,
}

impl<'w, B: PersistenceBackend> StoreTransaction<'w, B> {
    /// Stage an upsert. See [`StoreWriter::upsert`].
    pub fn upsert<R: Resource>(
        &mut self,
        records: Vec<R>,
        key: Option<&CacheKey>,
    ) -> Result<MutationSummary> {
        let staged = staged_table::<R, B>(&mut self.tables, self.store);
        let mut delta = MutationSummary::default();
        stage_upsert(&mut staged.next, records, key, &mut self.batch, &mut delta)?;
        staged.record(ChangeKind::Upsert, &delta);
        self.summary.merge(delta.clone());
        Ok(delta)
    }

    /// Stage removal of every record matching `predicate`.
    pub fn delete<R, F>(&mut self, predicate: F) -> MutationSummary
    where
        R: Resource,
        F: Fn(&R) -> bool,
    {
        let staged = staged_table::<R, B>(&mut self.tables, self.store);
        let mut delta = MutationSummary::default();
        stage_remove(&mut staged.next, |s| predicate(&s.record), &mut self.batch, &mut delta);
        staged.record(ChangeKind::Delete, &delta);
        self.summary.merge(delta.clone());
        delta
    }

    /// Stage cross-key invalidation: remove records matching `predicate` that
    /// are not part of `excluding`'s result set.
    ///
    /// Keys that lose records are listed in [`MutationSummary::affected_keys`].
    pub fn invalidate<R, F>(&mut self, predicate: F, excluding: &CacheKey) -> MutationSummary
    where
        R: Resource,
        F: Fn(&R) -> bool,
    {
        let staged = staged_table::<R, B>(&mut self.tables, self.store);
        let mut delta = MutationSummary::default();
        stage_remove(
            &mut staged.next,
            |s| !s.is_member_of(excluding) && predicate(&s.record),
            &mut self.batch,
            &mut delta,
        );
        staged.record(ChangeKind::Delete, &delta);
        self.summary.merge(delta.clone());
        delta
    }

    /// Stage `records` as the complete result set of `key`.
    ///
    /// Records previously in the set but absent now leave it; a record that
    /// belongs to no key afterwards is deleted.
    pub fn replace_for_key<R: Resource>(
        &mut self,
        key: &CacheKey,
        records: Vec<R>,
    ) -> Result<MutationSummary> {
        let staged = staged_table::<R, B>(&mut self.tables, self.store);
        let mut delta = MutationSummary::default();
        let keep: HashSet<R::Id> = records.iter().map(Resource::id).collect();
        stage_upsert(&mut staged.next, records, Some(key), &mut self.batch, &mut delta)?;
        stage_retain(&mut staged.next, key, &keep, &mut self.batch, &mut delta)?;
        staged.record(ChangeKind::Replace, &delta);
        self.summary.merge(delta.clone());
        Ok(delta)
    }

    /// Stage dropping every member of `key`'s result set not in `keep`.
    pub fn retain_for_key<R: Resource>(
        &mut self,
        key: &CacheKey,
        keep: &HashSet<R::Id>,
    ) -> Result<MutationSummary> {
        let staged = staged_table::<R, B>(&mut self.tables, self.store);
        let mut delta = MutationSummary::default();
        stage_retain(&mut staged.next, key, keep, &mut self.batch, &mut delta)?;
        staged.record(ChangeKind::Replace, &delta);
        self.summary.merge(delta.clone());
        Ok(delta)
    }

    /// Everything staged so far.
    pub fn summary(&self) -> &MutationSummary {
        &self.summary
    }

    /// Apply the staged batch, then publish.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the backend rejects the batch. Nothing
    /// is published in that case.
    pub async fn commit(self) -> Result<MutationSummary> {
        let StoreTransaction {
            store,
            tables,
            batch,
            summary,
        } = self;
        if batch.is_empty() {
            return Ok(summary);
        }

        store
            .backend()
            .apply(batch)
            .await
            .map_err(into_persistence)?;

        for (_, staged) in tables {
            if let Some(event) = staged.publish() {
                store.notify(event);
            }
        }
        Ok(summary)
    }
}

/// Pending record set of one table inside a transaction.
trait StagedTable: Send {
    fn as_any(&mut self) -> &mut dyn Any;
    /// Swap the staged records in. `None` if nothing changed.
    fn publish(self: Box<Self>) -> Option<ChangeEvent>;
}

struct Staged<R: Resource> {
    table: Arc<Table<R>>,
    next: Records<R>,
    kind: Option<ChangeKind>,
    upserted: usize,
    removed: usize,
}

impl<R: Resource> Staged<R> {
    fn record(&mut self, kind: ChangeKind, delta: &MutationSummary) {
        if delta.is_empty() {
            return;
        }
        self.upserted += delta.upserted;
        self.removed += delta.removed;
        self.kind = Some(match self.kind {
            Some(previous) if previous != kind => ChangeKind::Replace,
            _ => kind,
        });
    }
}

impl<R: Resource> StagedTable for Staged<R> {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn publish(self: Box<Self>) -> Option<ChangeEvent> {
        let kind = self.kind?;
        let version = self.table.publish(self.next);
        Some(ChangeEvent {
            resource_type: R::resource_type(),
            kind,
            version,
            upserted: self.upserted,
            removed: self.removed,
        })
    }
}

fn staged_table<'t, R: Resource, B: PersistenceBackend>(
    tables: &'t mut Vec<(TypeId, Box<dyn StagedTable>)>,
    store: &LocalStore<B>,
) -> &'t mut Staged<R> {
    let type_id = TypeId::of::<R>();
    let slot = match tables.iter().position(|(id, _)| *id == type_id) {
        Some(slot) => slot,
        None => {
            let table = store.table::<R>();
            let next = table.current().records.clone();
            tables.push((
                type_id,
                Box::new(Staged {
                    table,
                    next,
                    kind: None,
                    upserted: 0,
                    removed: 0,
                }),
            ));
            tables.len() - 1
        }
    };
    match tables[slot].1.as_any().downcast_mut::<Staged<R>>() {
        Some(staged) => staged,
        // Keyed by TypeId, so the slot always holds a Staged<R>.
        None => unreachable!("staged table does not match its TypeId"),
    }
}

fn stage_upsert<R: Resource>(
    records: &mut Records<R>,
    incoming: Vec<R>,
    key: Option<&CacheKey>,
    batch: &mut WriteBatch,
    summary: &mut MutationSummary,
) -> Result<()> {
    for record in incoming {
        let id = record.id();
        let existing = records.get(&id);
        let mut keys = existing.map(|s| s.keys.clone()).unwrap_or_default();
        if let Some(key) = key {
            keys.insert(key.clone());
        }
        let stored = StoredRecord { record, keys };
        if existing.is_some_and(|s| **s == stored) {
            summary.unchanged += 1;
            continue;
        }

        batch.put(stored.record.identity(), encode_record(&stored)?);
        records.insert(id, Arc::new(stored));
        summary.upserted += 1;
    }
    Ok(())
}

fn stage_remove<R, F>(
    records: &mut Records<R>,
    remove: F,
    batch: &mut WriteBatch,
    summary: &mut MutationSummary,
) where
    R: Resource,
    F: Fn(&StoredRecord<R>) -> bool,
{
    let doomed: Vec<R::Id> = records
        .iter()
        .filter(|(_, stored)| remove(stored))
        .map(|(id, _)| id.clone())
        .collect();

    for id in doomed {
        if let Some(stored) = records.remove(&id) {
            summary.affected_keys.extend(stored.keys.iter().cloned());
            batch.delete(stored.record.identity());
            summary.removed += 1;
        }
    }
}

fn stage_retain<R: Resource>(
    records: &mut Records<R>,
    key: &CacheKey,
    keep: &HashSet<R::Id>,
    batch: &mut WriteBatch,
    summary: &mut MutationSummary,
) -> Result<()> {
    let leaving: Vec<R::Id> = records
        .iter()
        .filter(|(id, stored)| stored.is_member_of(key) && !keep.contains(*id))
        .map(|(id, _)| id.clone())
        .collect();

    for id in leaving {
        let Some(stored) = records.get(&id) else {
            continue;
        };
        let mut remaining = (**stored).clone();
        remaining.keys.remove(key);

        if remaining.keys.is_empty() {
            records.remove(&id);
            batch.delete(remaining.record.identity());
            summary.removed += 1;
        } else {
            batch.put(remaining.record.identity(), encode_record(&remaining)?);
            records.insert(id, Arc::new(remaining));
            summary.upserted += 1;
        }
    }
    Ok(())
}
