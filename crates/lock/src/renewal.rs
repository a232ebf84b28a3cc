use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{trace, warn};
use usercore_kv::{KvStore, SharedStore};

/// Spawn the task that keeps a held lock alive.
///
/// The task wakes every `ttl / 2` and pushes the expiry of `store_key` back
/// to `ttl`, but only while the key still holds `token`. It exits, setting
/// `lost`, as soon as a renewal fails or finds the lock owned by someone
/// else. The owning guard aborts the task on release.
pub(crate) fn spawn_renewal(
    store: SharedStore,
    store_key: String,
    token: String,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let period = (ttl / 2).max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match store.expire_if_eq(&store_key, token.as_bytes(), ttl).await {
                Ok(true) => {
                    trace!(key = %store_key, "lock renewed");
                }
                Ok(false) => {
                    warn!(key = %store_key, "lock expired or taken over before renewal");
                    lost.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    warn!(key = %store_key, error = %e, "lock renewal failed, presuming lock lost");
                    lost.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    })
}
