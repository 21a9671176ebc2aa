//! Error types for cache operations
//!
//! Programmer errors (bad keys, bad TTLs, lifecycle misuse) are returned at the
//! call site. Fetch failures carry the fetcher's own error untouched, with only
//! the key attached for diagnostics.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main error type for cache operations
///
/// The type is `Clone` so one settled outcome can be handed to every caller
/// that joined the same execution.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The key is empty or otherwise unusable as a fingerprint
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    /// The TTL cannot be represented as an expiry instant
    #[error("Invalid ttl {ttl:?} for key {key}")]
    InvalidTtl { key: String, ttl: Duration },

    /// The cache was used before `start()`
    #[error("Cache is not started")]
    NotStarted,

    /// The cache was used after `dispose()`
    #[error("Cache has been disposed")]
    Disposed,

    /// The fetcher failed; shared verbatim with every waiter
    #[error("Fetch failed for {key}: {cause:#}")]
    Fetch {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    /// The shared execution ended without producing an outcome
    #[error("Execution for {key} was abandoned before it settled")]
    Abandoned { key: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl CacheError {
    /// Wrap a fetcher error, attaching the key it was fetched for
    pub fn fetch(key: impl Into<String>, cause: anyhow::Error) -> Self {
        CacheError::Fetch {
            key: key.into(),
            cause: Arc::new(cause),
        }
    }

    /// Whether this error came from the fetcher rather than from the cache itself
    pub fn is_fetch_error(&self) -> bool {
        matches!(self, CacheError::Fetch { .. })
    }

    /// The fetcher's original error, if any
    pub fn fetch_cause(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            CacheError::Fetch { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CacheError::InvalidKey(String::new());
        assert_eq!(error.to_string(), "Invalid cache key: \"\"");

        let error = CacheError::fetch("/customers/1", anyhow::anyhow!("connection reset"));
        assert_eq!(
            error.to_string(),
            "Fetch failed for /customers/1: connection reset"
        );

        let error = CacheError::Abandoned {
            key: "/departments".to_string(),
        };
        assert!(error.to_string().contains("/departments"));
    }

    #[test]
    fn test_fetch_cause_is_shared_on_clone() {
        let error = CacheError::fetch("/a", anyhow::anyhow!("boom"));
        let cloned = error.clone();

        let (Some(a), Some(b)) = (error.fetch_cause(), cloned.fetch_cause()) else {
            panic!("expected fetch errors");
        };
        assert!(Arc::ptr_eq(a, b));
        assert!(cloned.is_fetch_error());
        assert!(!CacheError::Disposed.is_fetch_error());
    }

    #[test]
    fn test_fetch_error_keeps_context_chain() {
        let cause = anyhow::anyhow!("timed out").context("GET /treatments");
        let error = CacheError::fetch("/treatments", cause);
        assert_eq!(
            error.to_string(),
            "Fetch failed for /treatments: GET /treatments: timed out"
        );
    }
}
