//! Error types for the synchronization engine.

use std::fmt;

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the synchronization engine.
///
/// Every fallible operation returns `Result<T>`. The type is `Clone` because a
/// single refresh outcome is delivered to every observer attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport failure while requesting a page.
    ///
    /// Carries the HTTP status code when the remote answered, `None` for
    /// connection-level failures and timeouts.
    ///
    /// **Recovery:** Caller-driven retry (`refresh(key, force = true)`).
    Network {
        /// HTTP status, if the server responded
        status: Option<u16>,
        /// Transport supplied description
        message: String,
    },

    /// A page payload could not be decoded into the record type.
    ///
    /// The whole drain is aborted; nothing is persisted.
    Decoding(String),

    /// The pagination loop guard tripped.
    ///
    /// Raised when a continuation token repeats, or when the configured page
    /// cap is exceeded. Holds the offending token.
    CycleDetected(String),

    /// Caller-initiated abort.
    ///
    /// Not a user-visible failure; see [`Error::is_user_visible`].
    Cancelled,

    /// Local store write failure (persistence backend or encoding).
    ///
    /// Fatal to the refresh attempt that hit it. Never retried automatically.
    Persistence(String),

    /// `refresh` was called for a cache key with no registered operation.
    NotRegistered(String),

    /// The owning scope was torn down (e.g. logout).
    ScopeEnded,

    /// Invalid configuration.
    Config(String),
}

impl Error {
    /// Build a network error from a status code and message.
    pub fn network(status: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Error::Network {
            status: status.into(),
            message: message.into(),
        }
    }

    /// True for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the presentation layer should surface this error.
    ///
    /// Cancellation is silent; everything else is shown next to the last-good data.
    pub fn is_user_visible(&self) -> bool {
        !self.is_cancelled()
    }

    /// HTTP status code for network errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Network { status, .. } => *status,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Network {
                status: Some(code),
                message,
            } => write!(f, "Network error ({}): {}", code, message),
            Error::Network {
                status: None,
                message,
            } => write!(f, "Network error: {}", message),
            Error::Decoding(msg) => write!(f, "Decoding error: {}", msg),
            Error::CycleDetected(token) => {
                write!(f, "Pagination cycle detected at token {}", token)
            }
            Error::Cancelled => write!(f, "Cancelled"),
            Error::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            Error::NotRegistered(key) => {
                write!(f, "No sync operation registered for key {}", key)
            }
            Error::ScopeEnded => write!(f, "Scope ended"),
            Error::Config(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decoding(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::network(503, "unavailable");
        assert_eq!(err.to_string(), "Network error (503): unavailable");

        let err = Error::network(None, "timed out");
        assert_eq!(err.to_string(), "Network error: timed out");

        assert_eq!(
            Error::CycleDetected("page=2".to_string()).to_string(),
            "Pagination cycle detected at token page=2"
        );
    }

    #[test]
    fn test_cancelled_is_silent() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_user_visible());
        assert!(Error::Decoding("bad".to_string()).is_user_visible());
    }

    #[test]
    fn test_status() {
        assert_eq!(Error::network(404, "missing").status(), Some(404));
        assert_eq!(Error::Cancelled.status(), None);
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: Error = serde_json::from_str::<u32>("\"nope\"")
            .map_err(Error::from)
            .unwrap_err();
        assert!(matches!(err, Error::Decoding(_)));
    }
}
