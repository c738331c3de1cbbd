//! Immutable table snapshots.

use crate::entity::Resource;
use crate::key::CacheKey;
use crate::query::Query;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// A record plus the cache keys whose result sets contain it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord<R> {
    pub record: R,
    pub keys: BTreeSet<CacheKey>,
}

impl<R: Resource> StoredRecord<R> {
    pub fn new(record: R) -> Self {
        StoredRecord {
            record,
            keys: BTreeSet::new(),
        }
    }

    pub fn is_member_of(&self, key: &CacheKey) -> bool {
        self.keys.contains(key)
    }
}

/// Point-in-time view of one resource table.
///
/// Snapshots are never mutated. Every store mutation builds a new one and
/// publishes it in a single swap, so a reader holding a snapshot sees either
/// all or none of a mutation.
pub struct Snapshot<R: Resource> {
    pub(crate) records: HashMap<R::Id, Arc<StoredRecord<R>>>,
    pub(crate) version: u64,
}

impl<R: Resource> Snapshot<R> {
    pub(crate) fn empty() -> Self {
        Snapshot {
            records: HashMap::new(),
            version: 0,
        }
    }

    /// Monotonic per-table version, bumped by every published mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &R::Id) -> Option<&R> {
        self.records.get(id).map(|stored| &stored.record)
    }

    pub fn stored(&self, id: &R::Id) -> Option<&StoredRecord<R>> {
        self.records.get(id).map(Arc::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredRecord<R>> {
        self.records.values().map(Arc::as_ref)
    }

    /// Filter and order the records.
    pub fn query(&self, query: &Query<R>) -> Vec<R> {
        query.run(self.iter())
    }

    /// Records in the result set of `key`, ordered by id.
    pub fn records_for_key(&self, key: &CacheKey) -> Vec<R> {
        self.query(&Query::new().member_of(key.clone()))
    }
}

impl<R: Resource> fmt::Debug for Snapshot<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("resource_type", &R::resource_type())
            .field("version", &self.version)
            .field("len", &self.records.len())
            .finish()
    }
}

impl<R: Resource> Clone for Snapshot<R> {
    fn clone(&self) -> Self {
        Snapshot {
            records: self.records.clone(),
            version: self.version,
        }
    }
}
