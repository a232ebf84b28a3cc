use std::time::Duration;

use tracing::debug;
use usercore_common::CoreResult;
use usercore_kv::{KvStore, SharedStore};
use uuid::Uuid;

use crate::{rate_limit_key, WindowVerdict};

/// Store-backed sliding window log.
///
/// Each admitted request is a member of the sorted set
/// `rate_limit:<client>`, scored by its epoch-millisecond timestamp. A check
/// is a single [`KvStore::zwindow_admit`] call: the store prunes members
/// older than the window, counts the rest and records the request only if
/// the count is below `limit`, all as one atomic step. Concurrent checks
/// from any number of instances therefore admit exactly `limit` requests
/// per window, and refused requests never extend a client's penalty.
///
/// Unlike a fixed window there is no boundary burst: any trailing interval
/// of one window length contains at most `limit` admitted requests. The
/// cost is a server-side script and one sorted-set member per admitted
/// request.
pub struct SlidingWindowLog {
    store: SharedStore,
    limit: u64,
    window: Duration,
}

impl SlidingWindowLog {
    pub fn new(store: SharedStore, limit: u64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }

    pub async fn check(&self, client_key: &str) -> CoreResult<WindowVerdict> {
        self.check_at(client_key, chrono::Utc::now().timestamp_millis())
            .await
    }

    pub(crate) async fn check_at(&self, client_key: &str, now_ms: i64) -> CoreResult<WindowVerdict> {
        let key = rate_limit_key(client_key);
        let window_ms = self.window.as_millis() as i64;
        let clear_before = now_ms - window_ms;
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let (admitted, count) = self
            .store
            .zwindow_admit(
                &key,
                now_ms as f64,
                clear_before as f64,
                self.limit,
                &member,
                self.window,
            )
            .await?;
        if admitted {
            return Ok(WindowVerdict::Allowed);
        }

        debug!(key = %key, count, limit = self.limit, "sliding window exceeded");
        Ok(WindowVerdict::Exceeded {
            retry_after: self.window,
        })
    }
}
