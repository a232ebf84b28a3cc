//! Key-value store abstraction shared by the lock, cache and rate limiter.
//!
//! Every coordination primitive in the workspace talks to the store through
//! the [`KvStore`] trait, which models the small subset of Redis commands the
//! core relies on:
//!
//! - plain values: `GET`, `SET .. PX`, `SET .. NX PX`, `DEL`, `EXISTS`,
//!   `PEXPIRE`, `PTTL`, `INCR`
//! - sorted sets: `ZADD`, `ZREM`, `ZCARD`, `ZREMRANGEBYSCORE`, plus an
//!   atomic prune-count-add step for sliding windows
//! - compare-and-act on a value, used for ownership-checked lock release and
//!   renewal
//!
//! Three implementations are provided:
//!
//! - [`RedisStore`] -- the production backend.
//! - [`MemoryStore`] -- an in-process backend with fault and latency
//!   injection, used by tests and single-instance development setups.
//! - [`TimeoutStore`] -- a wrapper bounding every call of an inner store.
//!
//! Components receive a [`SharedStore`] at construction time; there is no
//! process-wide client handle.

pub mod memory;
pub mod redis_store;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use usercore_common::CoreResult;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use timeout::TimeoutStore;

/// Reference-counted handle to a store implementation.
pub type SharedStore = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Fetch the value stored under `key`, or `None` when absent.
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;

    /// Store `value` under `key` with the given expiry, replacing any
    /// existing value.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<()>;

    /// Store `value` only if `key` is absent. Returns `true` iff this call
    /// created the key.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<bool>;

    /// Delete `key`. Returns `true` if a key was removed.
    async fn del(&self, key: &str) -> CoreResult<bool>;

    async fn exists(&self, key: &str) -> CoreResult<bool>;

    /// Reset the expiry of `key`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<bool>;

    /// Remaining time to live, `None` if the key is missing or persistent.
    async fn pttl(&self, key: &str) -> CoreResult<Option<Duration>>;

    /// Atomically increment the integer stored at `key` (created as 0).
    async fn incr(&self, key: &str) -> CoreResult<i64>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()>;

    /// Remove `member` from the sorted set. Returns `true` if it was present.
    async fn zrem(&self, key: &str, member: &str) -> CoreResult<bool>;

    async fn zcard(&self, key: &str) -> CoreResult<u64>;

    /// Remove members whose score lies in `[min, max]`. Returns the number
    /// removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> CoreResult<u64>;

    /// Sliding-window admission as one atomic step on the sorted set `key`.
    ///
    /// Drops members scored at or below `clear_before`, then adds `member`
    /// with `score` and resets the expiry to `ttl` only if fewer than
    /// `limit` members remain. Returns whether `member` was added and the
    /// cardinality afterwards.
    async fn zwindow_admit(
        &self,
        key: &str,
        score: f64,
        clear_before: f64,
        limit: u64,
        member: &str,
        ttl: Duration,
    ) -> CoreResult<(bool, u64)>;

    /// Delete `key` only if it currently holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> CoreResult<bool>;

    /// Reset the expiry of `key` only if it currently holds `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> CoreResult<bool>;

    async fn ping(&self) -> CoreResult<()>;
}

/// Milliseconds for a store expiry. Zero is rejected by Redis, so sub-ms
/// durations are rounded up.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
    }
}
