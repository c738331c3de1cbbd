//! Cache key construction.
//!
//! A cache key identifies one logical request: resource type, scoping context and
//! every filter/sort parameter that changes the result set. Two requests that are
//! logically equal must build byte-identical keys, otherwise concurrent refreshes
//! would not coalesce.
//!
//! ```
//! use sync_kit::key::{cache_key, KeyParams};
//!
//! let a = cache_key("assignment", Some("course_1"), &KeyParams::new()
//!     .with("grading_period", "7")
//!     .with_set("include", ["submission", "overrides"]));
//! let b = cache_key("assignment", Some("course_1"), &KeyParams::new()
//!     .with_set("include", ["overrides", "submission"])
//!     .with("grading_period", "7"));
//! assert_eq!(a, b);
//! ```

use crate::entity::Resource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Immutable, deterministic identity of one cached request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-built key string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        CacheKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource type component (first segment).
    pub fn resource_type(&self) -> &str {
        self.0
            .split(|c| c == ':' || c == '?')
            .next()
            .unwrap_or_default()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single key parameter value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    /// One scalar value.
    Scalar(String),
    /// Logically unordered list (e.g. `include[]`). Sorted and deduplicated.
    Set(Vec<String>),
    /// Ordered list (e.g. sort columns). Order is significant.
    Sequence(Vec<String>),
}

impl ParamValue {
    fn render(&self) -> String {
        match self {
            ParamValue::Scalar(v) => escape(v),
            ParamValue::Set(values) | ParamValue::Sequence(values) => values
                .iter()
                .map(|v| escape(v))
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Filter/sort parameters that scope a cache key.
///
/// Parameters are kept sorted by name, so insertion order never affects the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyParams {
    params: BTreeMap<String, ParamValue>,
}

impl KeyParams {
    pub fn new() -> Self {
        KeyParams::default()
    }

    /// Add a scalar parameter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .insert(name.into(), ParamValue::Scalar(value.into()));
        self
    }

    /// Add a scalar parameter if present. `None` leaves the key unchanged, so
    /// "no grading period" and "parameter omitted" are the same key.
    pub fn with_opt<V: Into<String>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(name, v),
            None => self,
        }
    }

    /// Add an unordered list parameter.
    pub fn with_set<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let mut values: Vec<String> = values.into_iter().map(Into::into).collect();
        values.sort();
        values.dedup();
        self.params.insert(name.into(), ParamValue::Set(values));
        self
    }

    /// Add an ordered list parameter.
    pub fn with_sequence<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.params.insert(name.into(), ParamValue::Sequence(values));
        self
    }

    /// Add a normalized search term. Blank terms are omitted.
    pub fn search(self, text: &str) -> Self {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            self
        } else {
            self.with("search", normalized)
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn render(&self) -> String {
        self.params
            .iter()
            .map(|(name, value)| format!("{}={}", escape(name), value.render()))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Build the cache key for a request.
///
/// Format: `{resource_type}:{context_id}?{name=value&...}` with the context and
/// parameter segments omitted when empty. Reserved characters inside components
/// are percent-escaped so distinct inputs cannot collide.
pub fn cache_key(resource_type: &str, context_id: Option<&str>, params: &KeyParams) -> CacheKey {
    let mut key = escape(resource_type);
    if let Some(context) = context_id {
        key.push(':');
        key.push_str(&escape(context));
    }
    if !params.is_empty() {
        key.push('?');
        key.push_str(&params.render());
    }
    CacheKey(key)
}

/// Builder helpers for store and persistence keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Typed cache key for resource `R`.
    pub fn for_resource<R: Resource>(context_id: Option<&str>, params: &KeyParams) -> CacheKey {
        cache_key(R::resource_type(), context_id, params)
    }

    /// Persistence key for a record: `"{resource_type}:{id}"`.
    pub fn build<R: Resource>(id: &R::Id) -> String {
        format!("{}:{}", R::resource_type(), id)
    }

    /// Persistence key prefix for a resource type.
    pub fn prefix<R: Resource>() -> String {
        format!("{}:", R::resource_type())
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' | ':' | '?' | '&' | '=' | ',' => out.push_str(&format!("%{:02X}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}
