//! Short-lived mutual exclusion on top of the shared key-value store.
//!
//! A lock on resource `k` is the store key `lock:k` holding a random
//! ownership token, created with an atomic set-if-absent and an expiry.
//! The expiry is the safety net for a holder that crashes without
//! releasing.
//!
//! Acquisition never waits: callers get a [`LockGuard`] or `None` and pick
//! their own retry policy. Release and renewal are checked against the
//! token, so a holder whose lock already expired cannot delete or extend a
//! lock that has since been granted to someone else.
//!
//! When the store cannot be reached, acquisition fails closed (the lock is
//! reported as not acquired) and release is a logged no-op.

mod renewal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use usercore_common::CoreResult;
use usercore_kv::{KvStore, SharedStore};
use uuid::Uuid;

use crate::renewal::spawn_renewal;

const LOCK_PREFIX: &str = "lock:";

fn store_key(key: &str) -> String {
    format!("{}{}", LOCK_PREFIX, key)
}

/// Factory for locks on a shared store.
///
/// Cloning is cheap; clones share the store handle and the table of locks
/// taken through [`acquire`](Self::acquire).
#[derive(Clone)]
pub struct DistributedLock {
    store: SharedStore,
    held: Arc<DashMap<String, LockGuard>>,
}

impl DistributedLock {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            held: Arc::new(DashMap::new()),
        }
    }

    /// Try to take the lock on `key` for `ttl` without renewal.
    ///
    /// Returns `None` if the lock is held elsewhere or the store failed.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        self.acquire_inner(key, ttl, false).await
    }

    /// Like [`try_acquire`](Self::try_acquire), but keeps the lock alive
    /// with a background task until the guard is released or dropped.
    pub async fn try_acquire_with_renewal(&self, key: &str, ttl: Duration) -> Option<LockGuard> {
        self.acquire_inner(key, ttl, true).await
    }

    /// Take the lock on `key` and remember it on this instance, so it can be
    /// released by key with [`release`](Self::release). The lock is renewed
    /// until released.
    ///
    /// Returns `true` iff this call obtained exclusive ownership.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> bool {
        match self.try_acquire_with_renewal(key, ttl).await {
            Some(guard) => {
                self.held.insert(key.to_string(), guard);
                true
            }
            None => false,
        }
    }

    /// Release a lock previously taken with [`acquire`](Self::acquire) on
    /// this instance. A no-op when this instance does not hold `key`.
    pub async fn release(&self, key: &str) {
        match self.held.remove(key) {
            Some((_, guard)) => guard.release().await,
            None => debug!(key, "release called for a lock not held by this instance"),
        }
    }

    /// Whether any holder currently owns `key`.
    pub async fn is_locked(&self, key: &str) -> CoreResult<bool> {
        self.store.exists(&store_key(key)).await
    }

    async fn acquire_inner(&self, key: &str, ttl: Duration, renew: bool) -> Option<LockGuard> {
        let store_key = store_key(key);
        let token = Uuid::new_v4().to_string();

        match self
            .store
            .set_nx_ex(&store_key, token.as_bytes(), ttl)
            .await
        {
            Ok(true) => {
                debug!(key = %store_key, ttl_ms = ttl.as_millis() as u64, renew, "lock acquired");
                let lost = Arc::new(AtomicBool::new(false));
                let renewal = renew.then(|| {
                    spawn_renewal(
                        Arc::clone(&self.store),
                        store_key.clone(),
                        token.clone(),
                        ttl,
                        Arc::clone(&lost),
                    )
                });
                Some(LockGuard {
                    store: Arc::clone(&self.store),
                    key: key.to_string(),
                    store_key,
                    token,
                    renewal,
                    lost,
                })
            }
            Ok(false) => {
                debug!(key = %store_key, "lock already held");
                None
            }
            Err(e) => {
                warn!(key = %store_key, error = %e, "lock acquire failed, treating as not acquired");
                None
            }
        }
    }
}

/// Proof of ownership of one lock.
///
/// Call [`release`](Self::release) when the critical section ends. Dropping
/// the guard without releasing stops renewal and leaves the lock to expire.
pub struct LockGuard {
    store: SharedStore,
    key: String,
    store_key: String,
    token: String,
    renewal: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `false` once the renewal task has detected that the lock expired,
    /// was taken over, or could not be renewed.
    pub fn is_held(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewal and delete the lock if it still carries this guard's
    /// token. Store errors are logged and absorbed.
    pub async fn release(mut self) {
        self.stop_renewal();

        match self
            .store
            .del_if_eq(&self.store_key, self.token.as_bytes())
            .await
        {
            Ok(true) => debug!(key = %self.store_key, "lock released"),
            Ok(false) => debug!(key = %self.store_key, "lock already expired or owned elsewhere"),
            Err(e) => warn!(key = %self.store_key, error = %e, "lock release failed"),
        }
    }

    fn stop_renewal(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("renewing", &self.renewal.is_some())
            .field("held", &self.is_held())
            .finish()
    }
}
