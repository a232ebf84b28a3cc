use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use usercore_common::{CoreError, CoreResult};

use crate::KvStore;

/// Wraps a store and bounds every call with [`tokio::time::timeout`].
///
/// A call that does not finish within the configured duration is abandoned
/// and reported as [`CoreError::StoreTimeout`], which callers classify the
/// same way as an unreachable store.
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: KvStore> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> CoreResult<T>
    where
        F: Future<Output = CoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "store call timed out");
                Err(CoreError::StoreTimeout {
                    op,
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl<S: KvStore> KvStore for TimeoutStore<S> {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<()> {
        self.bounded("set_ex", self.inner.set_ex(key, value, ttl)).await
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<bool> {
        self.bounded("set_nx_ex", self.inner.set_nx_ex(key, value, ttl))
            .await
    }

    async fn del(&self, key: &str) -> CoreResult<bool> {
        self.bounded("del", self.inner.del(key)).await
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        self.bounded("exists", self.inner.exists(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<bool> {
        self.bounded("expire", self.inner.expire(key, ttl)).await
    }

    async fn pttl(&self, key: &str) -> CoreResult<Option<Duration>> {
        self.bounded("pttl", self.inner.pttl(key)).await
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        self.bounded("incr", self.inner.incr(key)).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()> {
        self.bounded("zadd", self.inner.zadd(key, score, member)).await
    }

    async fn zrem(&self, key: &str, member: &str) -> CoreResult<bool> {
        self.bounded("zrem", self.inner.zrem(key, member)).await
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        self.bounded("zcard", self.inner.zcard(key)).await
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        self.bounded(
            "zrem_range_by_score",
            self.inner.zrem_range_by_score(key, min, max),
        )
        .await
    }

    async fn zwindow_admit(
        &self,
        key: &str,
        score: f64,
        clear_before: f64,
        limit: u64,
        member: &str,
        ttl: Duration,
    ) -> CoreResult<(bool, u64)> {
        self.bounded(
            "zwindow_admit",
            self.inner
                .zwindow_admit(key, score, clear_before, limit, member, ttl),
        )
        .await
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> CoreResult<bool> {
        self.bounded("del_if_eq", self.inner.del_if_eq(key, expected))
            .await
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> CoreResult<bool> {
        self.bounded("expire_if_eq", self.inner.expire_if_eq(key, expected, ttl))
            .await
    }

    async fn ping(&self) -> CoreResult<()> {
        self.bounded("ping", self.inner.ping()).await
    }
}
