use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which admission check turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitScope {
    /// The per-instance token bucket.
    Local,
    /// The store-backed per-client counter shared by all instances.
    Global,
}

impl LimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitScope::Local => "local",
            LimitScope::Global => "global",
        }
    }
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("key-value store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("key-value store operation `{op}` timed out after {timeout:?}")]
    StoreTimeout { op: &'static str, timeout: Duration },

    #[error("key-value store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("too many requests for {key} ({scope} limit), retry after {retry_after:?}")]
    RateLimited {
        key: String,
        scope: LimitScope,
        retry_after: Duration,
    },

    #[error("cache key {key} still being repopulated after {attempts} attempts")]
    CacheContention { key: String, attempts: u32 },

    #[error("failed to load authoritative record: {0}")]
    Load(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Returns `true` when the error means the key-value store could not be
    /// reached or did not answer in time.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            CoreError::StoreUnavailable(_) | CoreError::StoreTimeout { .. }
        )
    }

    /// Retry hint carried by a rate-limit rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_classified() {
        assert!(CoreError::StoreUnavailable("refused".into()).is_store_failure());
        assert!(CoreError::StoreTimeout {
            op: "get",
            timeout: Duration::from_millis(10),
        }
        .is_store_failure());
        assert!(!CoreError::Store("WRONGTYPE".into()).is_store_failure());
        assert!(!CoreError::Load("db down".into()).is_store_failure());
    }

    #[test]
    fn rate_limited_carries_retry_hint() {
        let err = CoreError::RateLimited {
            key: "1.2.3.4".into(),
            scope: LimitScope::Global,
            retry_after: Duration::from_secs(12),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert!(err.to_string().contains("global limit"));
        assert_eq!(CoreError::Config("x".into()).retry_after(), None);
    }
}
