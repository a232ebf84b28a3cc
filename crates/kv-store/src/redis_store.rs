use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::info;
use usercore_common::{CoreError, CoreResult};

use crate::{ttl_millis, KvStore};

const DEL_IF_EQ_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXPIRE_IF_EQ_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const ZWINDOW_ADMIT_LUA: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
local count = redis.call('ZCARD', KEYS[1])
if count < tonumber(ARGV[3]) then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
    redis.call('PEXPIRE', KEYS[1], ARGV[5])
    return {1, count + 1}
end
return {0, count}
"#;

/// [`KvStore`] backed by a Redis server.
///
/// Commands go through a [`ConnectionManager`], which multiplexes requests
/// over one connection and reconnects transparently after failures. The
/// manager is cheap to clone, so every call works on its own clone.
///
/// The store itself does not bound call duration; wrap it in a
/// [`TimeoutStore`](crate::TimeoutStore) for that.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    del_if_eq_script: Script,
    expire_if_eq_script: Script,
    zwindow_admit_script: Script,
}

impl RedisStore {
    /// Connect to the server at `url`, failing if the initial connection
    /// is not established within `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> CoreResult<Self> {
        let client = Client::open(url).map_err(|e| CoreError::Config(e.to_string()))?;

        let connection_manager =
            tokio::time::timeout(connect_timeout, client.get_connection_manager())
                .await
                .map_err(|_| CoreError::StoreTimeout {
                    op: "connect",
                    timeout: connect_timeout,
                })?
                .map_err(map_redis_error)?;

        info!(timeout_ms = connect_timeout.as_millis() as u64, "connected to redis");

        Ok(Self::from_connection_manager(connection_manager))
    }

    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            del_if_eq_script: Script::new(DEL_IF_EQ_LUA),
            expire_if_eq_script: Script::new(EXPIRE_IF_EQ_LUA),
            zwindow_admit_script: Script::new(ZWINDOW_ADMIT_LUA),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

/// Connection-level failures mean the store is unreachable; everything else
/// is a protocol or data error reported by the server.
fn map_redis_error(err: RedisError) -> CoreError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        CoreError::StoreUnavailable(err.to_string())
    } else {
        CoreError::Store(err.to_string())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<()> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .arg("NX")
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> CoreResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<bool> {
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(updated == 1)
    }

    async fn pttl(&self, key: &str) -> CoreResult<Option<Duration>> {
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        // -2: no such key, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        let value: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(value)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()> {
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> CoreResult<bool> {
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        let count: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(count)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(removed)
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
        let (added, count): (i64, u64) = self
            .zwindow_admit_script
            .key(key)
            .arg(score)
            .arg(clear_before)
            .arg(limit)
            .arg(member)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok((added == 1, count))
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> CoreResult<bool> {
        let removed: i64 = self
            .del_if_eq_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(removed == 1)
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> CoreResult<bool> {
        let updated: i64 = self
            .expire_if_eq_script
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(updated == 1)
    }

    async fn ping(&self) -> CoreResult<()> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = map_redis_error(RedisError::from(io));
        assert!(err.is_store_failure());
    }

    #[test]
    fn server_errors_map_to_store_error() {
        let err = map_redis_error(RedisError::from((
            redis::ErrorKind::TypeError,
            "WRONGTYPE",
        )));
        assert!(matches!(err, CoreError::Store(_)));
    }

    #[tokio::test]
    async fn invalid_url_is_a_config_error() {
        let result = RedisStore::connect("not a url", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CoreError::Config(_))));
    }
}
