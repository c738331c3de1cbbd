//! Predicate + ordering over stored records.
//!
//! One generic query replaces the family of "collection by due date / by name /
//! by group" factories: pick a filter and an ordering at call time.
//!
//! ```
//! # use serde::{Deserialize, Serialize};
//! # use sync_kit::Resource;
//! # #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! # struct Assignment { id: u32, course_id: String, position: u32, name: String }
//! # impl Resource for Assignment {
//! #     type Id = u32;
//! #     fn id(&self) -> u32 { self.id }
//! #     fn resource_type() -> &'static str { "assignment" }
//! #     fn context_id(&self) -> Option<String> { Some(self.course_id.clone()) }
//! # }
//! use sync_kit::query::Query;
//!
//! let by_position = Query::<Assignment>::new()
//!     .context("course_1")
//!     .order_by_key(|a| a.position)
//!     .then_by_key(|a| a.name.clone());
//! ```

use crate::entity::Resource;
use crate::key::CacheKey;
use crate::store::StoredRecord;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type Predicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;
type Comparator<R> = Arc<dyn Fn(&R, &R) -> Ordering + Send + Sync>;

/// Filter and ordering for reading records back from the store.
///
/// Records that compare equal under every ordering are ordered by id, so the
/// materialized sequence is deterministic.
pub struct Query<R: Resource> {
    filters: Vec<Predicate<R>>,
    order: Vec<Comparator<R>>,
    member_of: Option<CacheKey>,
    context: Option<String>,
}

impl<R: Resource> Query<R> {
    /// Every record of the type, ordered by id.
    pub fn new() -> Self {
        Query {
            filters: Vec::new(),
            order: Vec::new(),
            member_of: None,
            context: None,
        }
    }

    /// Add a predicate. Multiple predicates must all hold.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(predicate));
        self
    }

    /// Only records in the result set of `key`.
    pub fn member_of(mut self, key: CacheKey) -> Self {
        self.member_of = Some(key);
        self
    }

    /// Only records whose parent context is `context_id`.
    pub fn context(mut self, context_id: impl Into<String>) -> Self {
        self.context = Some(context_id.into());
        self
    }

    /// Primary ordering. Replaces any ordering set before.
    pub fn order_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&R, &R) -> Ordering + Send + Sync + 'static,
    {
        self.order = vec![Arc::new(compare)];
        self
    }

    /// Primary ordering by an extracted key.
    pub fn order_by_key<K, F>(self, key: F) -> Self
    where
        K: Ord,
        F: Fn(&R) -> K + Send + Sync + 'static,
    {
        self.order_by(move |a, b| key(a).cmp(&key(b)))
    }

    /// Tie-breaking ordering, applied after the previous ones.
    pub fn then_by<F>(mut self, compare: F) -> Self
    where
        F: Fn(&R, &R) -> Ordering + Send + Sync + 'static,
    {
        self.order.push(Arc::new(compare));
        self
    }

    pub fn then_by_key<K, F>(self, key: F) -> Self
    where
        K: Ord,
        F: Fn(&R) -> K + Send + Sync + 'static,
    {
        self.then_by(move |a, b| key(a).cmp(&key(b)))
    }

    /// Reverse the whole ordering (including the id tie-break).
    pub fn descending(self) -> Self {
        let order = self.order;
        let mut query = Query {
            filters: self.filters,
            order: Vec::new(),
            member_of: self.member_of,
            context: self.context,
        };
        query.order.push(Arc::new(move |a: &R, b: &R| {
            compare_with(&order, a, b).reverse()
        }));
        query
    }

    pub fn matches(&self, stored: &StoredRecord<R>) -> bool {
        if let Some(key) = &self.member_of {
            if !stored.keys.contains(key) {
                return false;
            }
        }
        if let Some(context) = &self.context {
            if stored.record.context_id().as_deref() != Some(context.as_str()) {
                return false;
            }
        }
        self.filters.iter().all(|f| f(&stored.record))
    }

    pub fn compare(&self, a: &R, b: &R) -> Ordering {
        compare_with(&self.order, a, b)
    }

    /// Filter and sort `records`.
    pub fn run<'a, I>(&self, records: I) -> Vec<R>
    where
        I: IntoIterator<Item = &'a StoredRecord<R>>,
    {
        let mut matched: Vec<R> = records
            .into_iter()
            .filter(|stored| self.matches(stored))
            .map(|stored| stored.record.clone())
            .collect();
        matched.sort_by(|a, b| self.compare(a, b));
        matched
    }
}

fn compare_with<R: Resource>(order: &[Comparator<R>], a: &R, b: &R) -> Ordering {
    order
        .iter()
        .map(|cmp| cmp(a, b))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| a.id().cmp(&b.id()))
}

impl<R: Resource> Default for Query<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> Clone for Query<R> {
    fn clone(&self) -> Self {
        Query {
            filters: self.filters.clone(),
            order: self.order.clone(),
            member_of: self.member_of.clone(),
            context: self.context.clone(),
        }
    }
}

impl<R: Resource> fmt::Debug for Query<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("resource_type", &R::resource_type())
            .field("filters", &self.filters.len())
            .field("order", &self.order.len())
            .field("member_of", &self.member_of)
            .field("context", &self.context)
            .finish()
    }
}

/// Case-insensitive `*a*b*c*` match: every character of `pattern` appears in
/// `text` in order. An empty pattern matches everything.
pub fn fuzzy_match(pattern: &str, text: &str) -> bool {
    let text = text.to_lowercase();
    let mut remaining = text.chars();
    pattern
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .all(|needle| remaining.any(|c| c == needle))
}
