use std::time::Duration;

use tracing::debug;
use usercore_common::CoreResult;
use usercore_kv::{KvStore, SharedStore};

use crate::{rate_limit_key, WindowVerdict};

/// Store-backed fixed window counter.
///
/// The first request of a window creates `rate_limit:<client>` with `INCR`
/// and starts its expiry; every request increments the counter and is
/// rejected once the count passes `limit`. The whole key expires at the end
/// of the window, which resets the count.
///
/// At a window boundary a client can get up to `2 * limit` requests through
/// in quick succession (the tail of one window and the head of the next).
/// Rejected requests still increment the counter.
pub struct FixedWindowCounter {
    store: SharedStore,
    limit: u64,
    window: Duration,
}

impl FixedWindowCounter {
    pub fn new(store: SharedStore, limit: u64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }

    pub async fn check(&self, client_key: &str) -> CoreResult<WindowVerdict> {
        let key = rate_limit_key(client_key);

        let count = self.store.incr(&key).await?;
        if count == 1 {
            self.store.expire(&key, self.window).await?;
        }

        if count.max(0) as u64 <= self.limit {
            return Ok(WindowVerdict::Allowed);
        }

        let retry_after = match self.store.pttl(&key).await? {
            Some(remaining) => remaining,
            None => {
                // The expiry never got set (e.g. the EXPIRE after the first
                // INCR failed); without this the client stays blocked forever.
                self.store.expire(&key, self.window).await?;
                self.window
            }
        };
        debug!(key = %key, count, limit = self.limit, "fixed window exceeded");
        Ok(WindowVerdict::Exceeded { retry_after })
    }
}
