//! Request admission control for the user-core service.
//!
//! Every inbound request is checked twice, and must pass both checks:
//!
//! - **Local token bucket** -- one bucket per service instance, shared by
//!   all clients. Coarse backpressure that never touches the shared store.
//!
//! - **Global per-client window** -- a counter keyed by client (usually the
//!   remote address) in the shared store, so the limit holds across every
//!   instance. Two algorithms are available:
//!   - *fixed window counter*: one `INCR` per request, cheap, but allows a
//!     burst of up to twice the limit around a window boundary;
//!   - *sliding window log*: one sorted-set entry per admitted request,
//!     exact over any trailing window, at a few more store calls.
//!
//! The local bucket is consulted first; a request it refuses is never
//! recorded in the shared store. If the store cannot be reached the global
//! check fails open: the error is logged and only the local bucket limits
//! traffic until the store recovers.

pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use usercore_common::{CoreError, CoreResult, LimitScope, RateLimitAlgorithm, RateLimitConfig};
use usercore_kv::SharedStore;

pub use fixed_window::FixedWindowCounter;
pub use sliding_window::SlidingWindowLog;
pub use token_bucket::LocalTokenBucket;

const RATE_LIMIT_PREFIX: &str = "rate_limit:";

pub(crate) fn rate_limit_key(client_key: &str) -> String {
    format!("{}{}", RATE_LIMIT_PREFIX, client_key)
}

/// Outcome of a global window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    Allowed,
    Exceeded { retry_after: Duration },
}

/// Outcome of a full admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    /// The request must be answered with "too many requests".
    Rejected {
        scope: LimitScope,
        retry_after: Duration,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

/// Combined local + global rate limiter.
///
/// Construct it with [`from_config`](Self::from_config) or one of the
/// `new_*` constructors and call [`check`](Self::check) on every request.
/// The limiter is cheaply cloneable (backed by `Arc`) and safe to share
/// across tasks.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    enabled: bool,
    local: LocalTokenBucket,
    global: GlobalWindow,
}

enum GlobalWindow {
    FixedWindow(FixedWindowCounter),
    SlidingWindow(SlidingWindowLog),
}

impl RateLimiter {
    /// Build the limiter described by `config` on top of `store`.
    pub fn from_config(store: SharedStore, config: &RateLimitConfig) -> Self {
        let global = match config.algorithm {
            RateLimitAlgorithm::FixedWindow => GlobalWindow::FixedWindow(FixedWindowCounter::new(
                store,
                config.global_limit,
                config.window(),
            )),
            RateLimitAlgorithm::SlidingWindow => GlobalWindow::SlidingWindow(
                SlidingWindowLog::new(store, config.global_limit, config.window()),
            ),
        };

        tracing::info!(
            enabled = config.enabled,
            algorithm = ?config.algorithm,
            local_rps = config.local_rps,
            local_burst = config.local_burst,
            global_limit = config.global_limit,
            window_secs = config.window_secs,
            "creating rate limiter"
        );

        Self {
            inner: Arc::new(RateLimiterInner {
                enabled: config.enabled,
                local: LocalTokenBucket::new(config.local_rps, config.local_burst),
                global,
            }),
        }
    }

    /// Token bucket in front of a fixed window counter.
    pub fn new_fixed_window(
        store: SharedStore,
        local_rps: u64,
        local_burst: u64,
        global_limit: u64,
        window: Duration,
    ) -> Self {
        Self::from_config(
            store,
            &Self::settings(RateLimitAlgorithm::FixedWindow, local_rps, local_burst, global_limit, window),
        )
    }

    /// Token bucket in front of a sliding window log.
    pub fn new_sliding_window(
        store: SharedStore,
        local_rps: u64,
        local_burst: u64,
        global_limit: u64,
        window: Duration,
    ) -> Self {
        Self::from_config(
            store,
            &Self::settings(RateLimitAlgorithm::SlidingWindow, local_rps, local_burst, global_limit, window),
        )
    }

    fn settings(
        algorithm: RateLimitAlgorithm,
        local_rps: u64,
        local_burst: u64,
        global_limit: u64,
        window: Duration,
    ) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            local_rps,
            local_burst,
            global_limit,
            window_secs: window.as_secs().max(1),
            algorithm,
        }
    }

    /// Decide whether the request from `client_key` may proceed.
    pub async fn check(&self, client_key: &str) -> RateLimitDecision {
        let inner = self.inner.as_ref();
        if !inner.enabled {
            return RateLimitDecision::Allowed;
        }

        if let Err(retry_after) = inner.local.try_acquire() {
            debug!(client = client_key, "local token bucket exhausted");
            return RateLimitDecision::Rejected {
                scope: LimitScope::Local,
                retry_after,
            };
        }

        let verdict = match &inner.global {
            GlobalWindow::FixedWindow(counter) => counter.check(client_key).await,
            GlobalWindow::SlidingWindow(log) => log.check(client_key).await,
        };

        match verdict {
            Ok(WindowVerdict::Allowed) => RateLimitDecision::Allowed,
            Ok(WindowVerdict::Exceeded { retry_after }) => RateLimitDecision::Rejected {
                scope: LimitScope::Global,
                retry_after,
            },
            Err(e) => {
                warn!(client = client_key, error = %e, "global rate limit check failed, allowing request");
                RateLimitDecision::Allowed
            }
        }
    }

    /// Returns `true` if the request is permitted.
    pub async fn allow(&self, client_key: &str) -> bool {
        self.check(client_key).await.is_allowed()
    }

    /// Like [`check`](Self::check), but reports a rejection as
    /// [`CoreError::RateLimited`].
    pub async fn enforce(&self, client_key: &str) -> CoreResult<()> {
        match self.check(client_key).await {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Rejected { scope, retry_after } => Err(CoreError::RateLimited {
                key: client_key.to_string(),
                scope,
                retry_after,
            }),
        }
    }
}
