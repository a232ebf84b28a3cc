use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::time::Instant;
use usercore_common::{CoreError, CoreResult};

use crate::KvStore;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

enum Value {
    Bytes(Vec<u8>),
    SortedSet(HashMap<String, f64>),
}

/// A stored value together with its optional expiry deadline.
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn bytes(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Bytes(data),
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn empty_set() -> Self {
        Self {
            value: Value::SortedSet(HashMap::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn holds(&self, expected: &[u8]) -> bool {
        matches!(&self.value, Value::Bytes(b) if b.as_slice() == expected)
    }
}

/// In-process [`KvStore`] backed by a [`DashMap`].
///
/// Expiry is evaluated lazily on access against [`tokio::time::Instant`], so
/// tests running on a paused Tokio clock can advance time deterministically.
///
/// The store can be switched into an "unreachable" state with
/// [`set_available`](Self::set_available) and can add artificial latency to
/// every call with [`set_latency`](Self::set_latency); both are used to
/// exercise the degradation paths of the components built on top of it.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// `true` when no key is held, counting not-yet-purged expired ones.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn precheck(&self) -> CoreResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoreError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
    }

    /// Entry for `key` under its shard lock, with an expired slot replaced
    /// by `fresh()` so it behaves like a missing key.
    fn live_or_insert_with<F>(&self, key: &str, fresh: F) -> RefMut<'_, String, Slot>
    where
        F: Fn() -> Slot,
    {
        let now = Instant::now();
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(&fresh);
        if slot.is_expired(now) {
            *slot = fresh();
        }
        slot
    }

    fn remove_if_empty_set(&self, key: &str) {
        self.entries.remove_if(key, |_, slot| {
            matches!(&slot.value, Value::SortedSet(set) if set.is_empty())
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        self.precheck().await?;
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(slot) => match &slot.value {
                Value::Bytes(b) => Ok(Some(b.clone())),
                Value::SortedSet(_) => Err(CoreError::Store(WRONG_TYPE.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<()> {
        self.precheck().await?;
        self.entries
            .insert(key.to_string(), Slot::bytes(value.to_vec(), Some(ttl)));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CoreResult<bool> {
        self.precheck().await?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(Instant::now()) {
                    return Ok(false);
                }
                occupied.insert(Slot::bytes(value.to_vec(), Some(ttl)));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::bytes(value.to_vec(), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> CoreResult<bool> {
        self.precheck().await?;
        self.purge_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        self.precheck().await?;
        self.purge_expired(key);
        Ok(self.entries.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CoreResult<bool> {
        self.precheck().await?;
        self.purge_expired(key);
        match self.entries.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pttl(&self, key: &str) -> CoreResult<Option<Duration>> {
        self.precheck().await?;
        self.purge_expired(key);
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .and_then(|slot| slot.expires_at.map(|at| at.saturating_duration_since(now))))
    }

    async fn incr(&self, key: &str) -> CoreResult<i64> {
        self.precheck().await?;
        let mut slot = self.live_or_insert_with(key, || Slot::bytes(b"0".to_vec(), None));

        let Value::Bytes(raw) = &mut slot.value else {
            return Err(CoreError::Store(WRONG_TYPE.to_string()));
        };
        let current: i64 = std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                CoreError::Store("ERR value is not an integer or out of range".to_string())
            })?;
        let next = current.checked_add(1).ok_or_else(|| {
            CoreError::Store("ERR increment or decrement would overflow".to_string())
        })?;
        *raw = next.to_string().into_bytes();
        Ok(next)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> CoreResult<()> {
        self.precheck().await?;
        let mut slot = self.live_or_insert_with(key, Slot::empty_set);
        match &mut slot.value {
            Value::SortedSet(set) => {
                set.insert(member.to_string(), score);
                Ok(())
            }
            Value::Bytes(_) => Err(CoreError::Store(WRONG_TYPE.to_string())),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> CoreResult<bool> {
        self.precheck().await?;
        self.purge_expired(key);
        let removed = match self.entries.get_mut(key) {
            Some(mut slot) => match &mut slot.value {
                Value::SortedSet(set) => set.remove(member).is_some(),
                Value::Bytes(_) => return Err(CoreError::Store(WRONG_TYPE.to_string())),
            },
            None => false,
        };
        self.remove_if_empty_set(key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> CoreResult<u64> {
        self.precheck().await?;
        self.purge_expired(key);
        match self.entries.get(key) {
            Some(slot) => match &slot.value {
                Value::SortedSet(set) => Ok(set.len() as u64),
                Value::Bytes(_) => Err(CoreError::Store(WRONG_TYPE.to_string())),
            },
            None => Ok(0),
        }
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> CoreResult<u64> {
        self.precheck().await?;
        self.purge_expired(key);
        let removed = match self.entries.get_mut(key) {
            Some(mut slot) => match &mut slot.value {
                Value::SortedSet(set) => {
                    let before = set.len();
                    set.retain(|_, score| *score < min || *score > max);
                    (before - set.len()) as u64
                }
                Value::Bytes(_) => return Err(CoreError::Store(WRONG_TYPE.to_string())),
            },
            None => 0,
        };
        self.remove_if_empty_set(key);
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
        self.precheck().await?;
        let outcome = {
            let mut slot = self.live_or_insert_with(key, Slot::empty_set);
            let Value::SortedSet(set) = &mut slot.value else {
                return Err(CoreError::Store(WRONG_TYPE.to_string()));
            };
            set.retain(|_, s| *s > clear_before);
            let count = set.len() as u64;
            if count < limit {
                set.insert(member.to_string(), score);
                slot.expires_at = Some(Instant::now() + ttl);
                (true, count + 1)
            } else {
                (false, count)
            }
        };
        self.remove_if_empty_set(key);
        Ok(outcome)
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> CoreResult<bool> {
        self.precheck().await?;
        self.purge_expired(key);
        Ok(self
            .entries
            .remove_if(key, |_, slot| slot.holds(expected))
            .is_some())
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> CoreResult<bool> {
        self.precheck().await?;
        self.purge_expired(key);
        match self.entries.get_mut(key) {
            Some(mut slot) if slot.holds(expected) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> CoreResult<()> {
        self.precheck().await
    }
}
