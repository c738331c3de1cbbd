//! Session scope: active context id and teardown boundary.

use crate::cancel::Cancellation;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

struct ScopeInner {
    context_id: Option<String>,
    ended: Cancellation,
    /// Collapsed section ids per sectioned collection.
    collapsed: DashMap<String, BTreeSet<String>>,
}

/// Lifetime boundary for refresh state (one logged-in session).
///
/// Passed to the coordinator at construction. [`Scope::end`] marks the boundary;
/// after it, refreshes fail with `Error::ScopeEnded` and section visibility
/// state is forgotten.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub fn new(context_id: impl Into<String>) -> Self {
        Self::build(Some(context_id.into()))
    }

    /// A scope with no active context.
    pub fn anonymous() -> Self {
        Self::build(None)
    }

    fn build(context_id: Option<String>) -> Self {
        Scope {
            inner: Arc::new(ScopeInner {
                context_id,
                ended: Cancellation::new(),
                collapsed: DashMap::new(),
            }),
        }
    }

    pub fn context_id(&self) -> Option<&str> {
        self.inner.context_id.as_deref()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    /// # Errors
    ///
    /// Returns `Error::ScopeEnded` after [`Scope::end`].
    pub fn check(&self) -> Result<()> {
        if self.is_ended() {
            Err(Error::ScopeEnded)
        } else {
            Ok(())
        }
    }

    /// End the scope. Idempotent.
    pub fn end(&self) {
        if !self.is_ended() {
            info!(
                "Scope {} ended",
                self.context_id().unwrap_or("<anonymous>")
            );
        }
        self.inner.ended.cancel();
        self.inner.collapsed.clear();
    }

    /// Resolves once the scope has ended.
    pub async fn ended(&self) {
        self.inner.ended.cancelled().await
    }

    /// Visibility state for the sectioned collection named `collection`.
    pub fn section_visibility(&self, collection: impl Into<String>) -> SectionVisibility {
        SectionVisibility {
            scope: self.clone(),
            collection: collection.into(),
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("context_id", &self.inner.context_id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Collapsed/expanded state of one sectioned collection's sections.
///
/// Lives in the [`Scope`], so rebuilding the collection keeps it.
#[derive(Clone, Debug)]
pub struct SectionVisibility {
    scope: Scope,
    collection: String,
}

impl SectionVisibility {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_collapsed(&self, section: &str) -> bool {
        self.scope
            .inner
            .collapsed
            .get(&self.collection)
            .is_some_and(|set| set.contains(section))
    }

    pub fn set_collapsed(&self, section: &str, collapsed: bool) {
        if self.scope.is_ended() {
            return;
        }
        let mut entry = self
            .scope
            .inner
            .collapsed
            .entry(self.collection.clone())
            .or_default();
        if collapsed {
            entry.insert(section.to_string());
        } else {
            entry.remove(section);
        }
    }

    /// Flip a section. Returns the new collapsed state.
    pub fn toggle(&self, section: &str) -> bool {
        let collapsed = !self.is_collapsed(section);
        self.set_collapsed(section, collapsed);
        collapsed
    }

    pub fn collapsed(&self) -> BTreeSet<String> {
        self.scope
            .inner
            .collapsed
            .get(&self.collection)
            .map(|set| set.clone())
            .unwrap_or_default()
    }
}
