//! Live collections: filtered, ordered views that follow the local store.
//!
//! A [`LiveCollection`] owns no records. It holds a [`Query`], a subscription to
//! its resource table and the last materialized sequence. Each recompute reads
//! one store snapshot, so the sequence always matches some complete store state.
//!
//! ```ignore
//! let query = Query::<Assignment>::new().order_by_key(|a| a.position);
//! let mut assignments = LiveCollection::new(&store, query);
//! render(assignments.items());
//!
//! while let Some(diff) = assignments.changed().await {
//!     table.delete_rows(&diff.removed);
//!     table.insert_rows(&diff.inserted);
//!     table.reload_rows(&diff.updated);
//! }
//! ```

use crate::backend::PersistenceBackend;
use crate::entity::Resource;
use crate::scope::SectionVisibility;
use crate::store::{LocalStore, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

pub use crate::query::{fuzzy_match, Query};

/// Index-level changes between two materialized sequences.
///
/// `removed` indexes the old sequence; `inserted` and `updated` index the new
/// one. `moved` lists `(old, new)` pairs for surviving records whose relative
/// order changed. A record that moved and changed appears in both `moved` and
/// `updated`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionDiff {
    pub inserted: Vec<usize>,
    pub updated: Vec<usize>,
    pub removed: Vec<usize>,
    pub moved: Vec<(usize, usize)>,
}

impl CollectionDiff {
    /// Compare sequences by record identity.
    pub fn between<R: Resource>(old: &[R], new: &[R]) -> Self {
        let old_index: HashMap<R::Id, usize> =
            old.iter().enumerate().map(|(i, r)| (r.id(), i)).collect();
        let new_ids: HashMap<R::Id, usize> =
            new.iter().enumerate().map(|(i, r)| (r.id(), i)).collect();

        let removed = old
            .iter()
            .enumerate()
            .filter(|(_, r)| !new_ids.contains_key(&r.id()))
            .map(|(i, _)| i)
            .collect();

        let mut inserted = Vec::new();
        let mut updated = Vec::new();
        // (old index, new index) of surviving records, in new order.
        let mut survivors = Vec::new();
        for (new_pos, record) in new.iter().enumerate() {
            match old_index.get(&record.id()) {
                None => inserted.push(new_pos),
                Some(&old_pos) => {
                    if old[old_pos] != *record {
                        updated.push(new_pos);
                    }
                    survivors.push((old_pos, new_pos));
                }
            }
        }

        let olds: Vec<usize> = survivors.iter().map(|(o, _)| *o).collect();
        let mut stays = vec![false; survivors.len()];
        for i in longest_increasing(&olds) {
            stays[i] = true;
        }
        let moved = survivors
            .into_iter()
            .zip(stays)
            .filter(|(_, stays)| !stays)
            .map(|(pair, _)| pair)
            .collect();

        CollectionDiff {
            inserted,
            updated,
            removed,
            moved,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
    }
}

/// Positions (into `seq`) of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<usize> {
    // tails[k]: position of the smallest tail of an increasing run of length k+1
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, &value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < value);
        if k > 0 {
            prev[i] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(i);
        } else {
            tails[k] = i;
        }
    }

    let mut out = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        out.push(i);
        cursor = prev[i];
    }
    out.reverse();
    out
}

/// Read-only, ordered view over one resource table.
pub struct LiveCollection<R: Resource> {
    rx: watch::Receiver<Arc<Snapshot<R>>>,
    query: Query<R>,
    items: Vec<R>,
    version: u64,
}

impl<R: Resource> LiveCollection<R> {
    pub fn new<B: PersistenceBackend>(store: &LocalStore<B>, query: Query<R>) -> Self {
        let mut rx = store.subscribe::<R>();
        let snapshot = rx.borrow_and_update().clone();
        LiveCollection {
            items: snapshot.query(&query),
            version: snapshot.version(),
            rx,
            query,
        }
    }

    /// Current materialized sequence.
    pub fn items(&self) -> &[R] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Store table version the sequence was computed from.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn query(&self) -> &Query<R> {
        &self.query
    }

    /// Recompute from the latest snapshot. `None` if the sequence is unchanged.
    pub fn recompute(&mut self) -> Option<CollectionDiff> {
        let snapshot = self.rx.borrow_and_update().clone();
        if snapshot.version() == self.version {
            return None;
        }
        self.version = snapshot.version();

        let items = snapshot.query(&self.query);
        let diff = CollectionDiff::between(&self.items, &items);
        self.items = items;
        if diff.is_empty() {
            None
        } else {
            Some(diff)
        }
    }

    /// Wait for the next store change that alters this view.
    ///
    /// Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<CollectionDiff> {
        loop {
            if let Some(diff) = self.recompute() {
                return Some(diff);
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

impl<R: Resource> std::fmt::Debug for LiveCollection<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCollection")
            .field("query", &self.query)
            .field("len", &self.items.len())
            .field("version", &self.version)
            .finish()
    }
}

/// One group of a [`LiveSections`] view.
#[derive(Clone, Debug, PartialEq)]
pub struct Section<R> {
    pub id: String,
    pub items: Vec<R>,
    pub collapsed: bool,
}

impl<R> Section<R> {
    /// Items to display: none while collapsed.
    pub fn visible_items(&self) -> &[R] {
        if self.collapsed {
            &[]
        } else {
            &self.items
        }
    }
}

/// A live collection grouped into ordered, collapsible sections.
///
/// Section order follows the first appearance of each section in the query's
/// ordering, so order by section first, then by position within the section.
pub struct LiveSections<R: Resource> {
    collection: LiveCollection<R>,
    section_of: Arc<dyn Fn(&R) -> String + Send + Sync>,
    visibility: SectionVisibility,
    sections: Vec<Section<R>>,
}

impl<R: Resource> LiveSections<R> {
    pub fn new<F>(collection: LiveCollection<R>, section_of: F, visibility: SectionVisibility) -> Self
    where
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        let mut sections = LiveSections {
            collection,
            section_of: Arc::new(section_of),
            visibility,
            sections: Vec::new(),
        };
        sections.regroup();
        sections
    }

    pub fn sections(&self) -> &[Section<R>] {
        &self.sections
    }

    pub fn section(&self, id: &str) -> Option<&Section<R>> {
        self.sections.iter().find(|s| s.id == id)
    }

    pub fn collection(&self) -> &LiveCollection<R> {
        &self.collection
    }

    /// Flip a section's visibility. Returns the new collapsed state.
    pub fn toggle(&mut self, id: &str) -> bool {
        let collapsed = self.visibility.toggle(id);
        self.apply_visibility();
        collapsed
    }

    pub fn set_collapsed(&mut self, id: &str, collapsed: bool) {
        self.visibility.set_collapsed(id, collapsed);
        self.apply_visibility();
    }

    /// Recompute from the latest snapshot. Returns the flat diff, if any.
    pub fn recompute(&mut self) -> Option<CollectionDiff> {
        let diff = self.collection.recompute()?;
        self.regroup();
        Some(diff)
    }

    /// Wait for the next change to the underlying collection.
    pub async fn changed(&mut self) -> Option<CollectionDiff> {
        let diff = self.collection.changed().await?;
        self.regroup();
        Some(diff)
    }

    fn regroup(&mut self) {
        let mut sections: Vec<Section<R>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for item in self.collection.items() {
            let id = (self.section_of)(item);
            let slot = match index.get(&id) {
                Some(&slot) => slot,
                None => {
                    index.insert(id.clone(), sections.len());
                    sections.push(Section {
                        collapsed: self.visibility.is_collapsed(&id),
                        id,
                        items: Vec::new(),
                    });
                    sections.len() - 1
                }
            };
            sections[slot].items.push(item.clone());
        }
        self.sections = sections;
    }

    fn apply_visibility(&mut self) {
        for section in &mut self.sections {
            section.collapsed = self.visibility.is_collapsed(&section.id);
        }
    }
}
