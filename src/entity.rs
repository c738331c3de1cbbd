//! Core record trait that every synchronized resource must implement.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;

/// Trait implemented by every resource record held in the local store.
///
/// Identity is `(resource_type(), id())`. The store never holds two records with
/// the same identity; writing one replaces the other.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use sync_kit::Resource;
///
/// #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// pub struct Assignment {
///     pub id: String,
///     pub course_id: String,
///     pub position: u32,
///     pub name: String,
/// }
///
/// impl Resource for Assignment {
///     type Id = String;
///
///     fn id(&self) -> Self::Id {
///         self.id.clone()
///     }
///
///     fn resource_type() -> &'static str {
///         "assignment"
///     }
///
///     fn context_id(&self) -> Option<String> {
///         Some(self.course_id.clone())
///     }
/// }
/// ```
pub trait Resource:
    Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone + PartialEq + 'static
{
    /// Stable remote identifier type.
    type Id: Display + Clone + Send + Sync + Eq + Hash + Ord + 'static;

    /// Return the record's remote identifier.
    fn id(&self) -> Self::Id;

    /// Resource type name. Used to namespace store tables, persistence keys
    /// and change notifications. Example: "assignment", "module_item".
    fn resource_type() -> &'static str;

    /// Parent context (course, user, group) this record belongs to.
    fn context_id(&self) -> Option<String> {
        None
    }

    /// Persistence key for this record: `"{resource_type}:{id}"`.
    fn identity(&self) -> String {
        crate::key::CacheKeyBuilder::build::<Self>(&self.id())
    }

    /// Optional: validate a record after it was decoded from a page.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
