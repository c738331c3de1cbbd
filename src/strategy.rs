//! Refresh strategies.
//!
//! An enum replaces the ad-hoc `force: bool` flag so call sites say what they
//! mean.
//!
//! ```text
//! Is cached data good enough?
//!     ├─ Always (offline / cache-first screens)   → CacheOnly
//!     ├─ Unless never fetched / invalidated / old → IfStale   (default)
//!     └─ No, the user asked for new data          → Force     (pull to refresh)
//! ```
//!
//! | Strategy | Never fetched | Fresh | Stale | In flight |
//! |----------|---------------|-------|-------|-----------|
//! | **CacheOnly** | no fetch | no fetch | no fetch | join |
//! | **IfStale** | fetch | no fetch | fetch | join |
//! | **Force** | fetch | fetch | fetch | join |
//!
//! A fetch already in flight is always joined, whatever the strategy.

/// How a refresh request treats the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RefreshStrategy {
    /// Never start a fetch; only join one already in flight.
    CacheOnly,

    /// Fetch when the key was never fetched, was invalidated, or has expired.
    #[default]
    IfStale,

    /// Always fetch. Retry affordances use this.
    Force,
}

impl RefreshStrategy {
    pub fn from_force(force: bool) -> Self {
        if force {
            RefreshStrategy::Force
        } else {
            RefreshStrategy::IfStale
        }
    }

    pub fn is_forced(self) -> bool {
        self == RefreshStrategy::Force
    }
}

impl From<bool> for RefreshStrategy {
    fn from(force: bool) -> Self {
        RefreshStrategy::from_force(force)
    }
}

impl std::fmt::Display for RefreshStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshStrategy::CacheOnly => write!(f, "CacheOnly"),
            RefreshStrategy::IfStale => write!(f, "IfStale"),
            RefreshStrategy::Force => write!(f, "Force"),
        }
    }
}
