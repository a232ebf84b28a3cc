//! Read-through cache for per-subject records with stampede protection.
//!
//! Records live in the shared store under `record:<id>` as JSON snapshots
//! with a configurable TTL. On a miss, the worker that wins the distributed
//! lock on `record:<id>` loads the authoritative record through a
//! [`RecordLoader`] and refills the cache; every other worker backs off and
//! re-reads the cache. Under sustained concurrent demand this bounds the
//! load on the authoritative source to one call per key per repopulation.
//!
//! Error handling follows three rules:
//!
//! - a failing cache lookup is surfaced, never treated as a miss, so a store
//!   outage cannot turn into a flood of authoritative loads;
//! - bytes that do not deserialize are a hard [`CoreError::Serde`] error;
//! - waiting for another repopulator is bounded by `max_miss_retries`, after
//!   which [`CoreError::CacheContention`] is returned.

mod stats;

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use usercore_common::{CacheConfig, CoreError, CoreResult};
use usercore_kv::{KvStore, SharedStore};
use usercore_lock::DistributedLock;

pub use stats::{CacheStats, CacheStatsSnapshot};

const RECORD_PREFIX: &str = "record:";

/// Store key for the cached snapshot of record `id`.
pub fn record_key(id: u64) -> String {
    format!("{}{}", RECORD_PREFIX, id)
}

/// Source of authoritative records, consulted on a cache miss.
#[async_trait]
pub trait RecordLoader<R>: Send + Sync + 'static {
    /// Load record `id`. `Ok(None)` means the record does not exist.
    async fn load(&self, id: u64) -> CoreResult<Option<R>>;
}

/// Tuning knobs of a [`StampedeProtectedCache`].
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl: Duration,
    /// Expiry of the repopulation lock.
    pub lock_timeout: Duration,
    /// Base pause before a waiting worker re-reads the cache.
    pub retry_backoff: Duration,
    /// How many times a worker re-reads before giving up.
    pub max_miss_retries: u32,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            lock_timeout: config.lock_timeout(),
            retry_backoff: config.retry_backoff(),
            max_miss_retries: config.max_miss_retries,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

pub struct StampedeProtectedCache<R, L> {
    store: SharedStore,
    lock: DistributedLock,
    loader: L,
    settings: CacheSettings,
    stats: CacheStats,
    _record: PhantomData<fn() -> R>,
}

impl<R, L> StampedeProtectedCache<R, L>
where
    R: Serialize + DeserializeOwned + Send + Sync,
    L: RecordLoader<R>,
{
    pub fn new(store: SharedStore, lock: DistributedLock, loader: L, settings: CacheSettings) -> Self {
        tracing::info!(
            ttl_secs = settings.ttl.as_secs(),
            lock_timeout_ms = settings.lock_timeout.as_millis() as u64,
            max_miss_retries = settings.max_miss_retries,
            "creating record cache"
        );
        Self {
            store,
            lock,
            loader,
            settings,
            stats: CacheStats::default(),
            _record: PhantomData,
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Return record `id`, loading and caching it on a miss.
    ///
    /// `Ok(None)` means the authoritative source has no such record; that
    /// answer is neither cached nor retried.
    pub async fn get(&self, id: u64) -> CoreResult<Option<R>> {
        let key = record_key(id);
        let mut waits = 0u32;

        loop {
            if let Some(record) = self.lookup(&key).await? {
                self.stats.record_hit();
                return Ok(Some(record));
            }
            if waits == 0 {
                self.stats.record_miss();
            }

            if let Some(guard) = self
                .lock
                .try_acquire_with_renewal(&key, self.settings.lock_timeout)
                .await
            {
                let result = self.repopulate(id, &key).await;
                guard.release().await;
                return result;
            }

            if waits >= self.settings.max_miss_retries {
                self.stats.record_exhausted();
                warn!(key = %key, attempts = waits + 1, "gave up waiting for cache repopulation");
                return Err(CoreError::CacheContention {
                    key,
                    attempts: waits + 1,
                });
            }

            waits += 1;
            self.stats.record_wait();
            let pause = self.backoff();
            debug!(key = %key, wait = waits, pause_ms = pause.as_millis() as u64, "cache key being repopulated elsewhere");
            tokio::time::sleep(pause).await;
        }
    }

    /// Cache-only lookup; never consults the loader.
    pub async fn get_cached(&self, id: u64) -> CoreResult<Option<R>> {
        self.lookup(&record_key(id)).await
    }

    /// Store a snapshot of `record` under `id`, replacing any existing one.
    pub async fn set(&self, id: u64, record: &R) -> CoreResult<()> {
        let payload = serde_json::to_vec(record)?;
        self.store
            .set_ex(&record_key(id), &payload, self.settings.ttl)
            .await
    }

    /// Drop the cached snapshot of `id`. Succeeds when nothing was cached.
    pub async fn invalidate(&self, id: u64) -> CoreResult<()> {
        let key = record_key(id);
        let removed = self.store.del(&key).await?;
        debug!(key = %key, removed, "cache entry invalidated");
        Ok(())
    }

    async fn lookup(&self, key: &str) -> CoreResult<Option<R>> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Runs while holding the repopulation lock.
    async fn repopulate(&self, id: u64, key: &str) -> CoreResult<Option<R>> {
        // Another worker may have filled the entry between our miss and
        // the lock acquisition.
        if let Some(record) = self.lookup(key).await? {
            self.stats.record_hit();
            return Ok(Some(record));
        }

        self.stats.record_load();
        let Some(record) = self.loader.load(id).await? else {
            debug!(key = %key, "record not found in authoritative source");
            return Ok(None);
        };

        if let Err(e) = self.set(id, &record).await {
            warn!(key = %key, error = %e, "failed to populate cache after load");
        }
        Ok(Some(record))
    }

    /// Base backoff plus up to 20% jitter so waiting workers do not re-read
    /// in lockstep.
    fn backoff(&self) -> Duration {
        let base = self.settings.retry_backoff;
        let max_jitter = base.as_millis() as u64 / 5;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        base + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use usercore_kv::{KvStore, MemoryStore};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        name: String,
    }

    fn profile(id: u64) -> Profile {
        Profile {
            id,
            name: format!("user-{}", id),
        }
    }

    struct CountingLoader {
        records: HashMap<u64, Profile>,
        calls: AtomicUsize,
        delay: Duration,
        fail_next: AtomicBool,
    }

    impl CountingLoader {
        fn with_ids(ids: &[u64]) -> Self {
            Self {
                records: ids.iter().map(|&id| (id, profile(id))).collect(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail_next: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RecordLoader<Profile> for CountingLoader {
        async fn load(&self, id: u64) -> CoreResult<Option<Profile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(CoreError::Load("database unavailable".into()));
            }
            Ok(self.records.get(&id).cloned())
        }
    }

    type TestCache = StampedeProtectedCache<Profile, CountingLoader>;

    fn cache_with(
        store: &Arc<MemoryStore>,
        loader: CountingLoader,
        settings: CacheSettings,
    ) -> TestCache {
        let shared: SharedStore = store.clone();
        StampedeProtectedCache::new(
            Arc::clone(&shared),
            DistributedLock::new(shared),
            loader,
            settings,
        )
    }

    fn settings() -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(600),
            lock_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(500),
            max_miss_retries: 10,
        }
    }

    #[tokio::test]
    async fn set_then_get_hits_without_loading() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[1]), settings());

        let mut record = profile(1);
        record.name = "cached".into();
        cache.set(1, &record).await.unwrap();

        assert_eq!(cache.get(1).await.unwrap(), Some(record));
        assert_eq!(cache.loader().calls(), 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn miss_loads_once_and_caches() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[7]), settings());

        assert_eq!(cache.get(7).await.unwrap(), Some(profile(7)));
        assert_eq!(cache.get(7).await.unwrap(), Some(profile(7)));
        assert_eq!(cache.loader().calls(), 1);
        assert!(store.exists("record:7").await.unwrap());
        assert!(!store.exists("lock:record:7").await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[3]), settings());

        cache.get(3).await.unwrap();
        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(cache.get_cached(3).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get_cached(3).await.unwrap().is_none());
        cache.get(3).await.unwrap();
        assert_eq!(cache.loader().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_load_once() {
        let store = Arc::new(MemoryStore::new());
        let mut loader = CountingLoader::with_ids(&[42]);
        loader.delay = Duration::from_millis(300);
        let cache = Arc::new(cache_with(&store, loader, settings()));

        let mut handles = Vec::new();
        for _ in 0..25 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get(42).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(profile(42)));
        }

        assert_eq!(cache.loader().calls(), 1);
        assert!(cache.stats().contention_waits >= 24);
    }

    #[tokio::test]
    async fn missing_record_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[]), settings());

        assert_eq!(cache.get(9).await.unwrap(), None);
        assert_eq!(cache.get(9).await.unwrap(), None);
        assert_eq!(cache.loader().calls(), 2);
        assert!(!store.exists("record:9").await.unwrap());
    }

    #[tokio::test]
    async fn load_failure_propagates_and_frees_lock() {
        let store = Arc::new(MemoryStore::new());
        let loader = CountingLoader::with_ids(&[5]);
        loader.fail_next.store(true, Ordering::SeqCst);
        let cache = cache_with(&store, loader, settings());

        assert!(matches!(cache.get(5).await, Err(CoreError::Load(_))));
        assert!(!store.exists("lock:record:5").await.unwrap());

        assert_eq!(cache.get(5).await.unwrap(), Some(profile(5)));
        assert_eq!(cache.loader().calls(), 2);
    }

    #[tokio::test]
    async fn corrupt_entry_is_an_error_not_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[4]), settings());
        store
            .set_ex("record:4", b"{not json", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(cache.get(4).await, Err(CoreError::Serde(_))));
        assert_eq!(cache.loader().calls(), 0);
    }

    #[tokio::test]
    async fn store_outage_is_surfaced() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[1]), settings());
        store.set_available(false);

        let err = cache.get(1).await.unwrap_err();
        assert!(err.is_store_failure());
        assert_eq!(cache.loader().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn contention_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let mut settings = settings();
        settings.max_miss_retries = 3;
        let cache = cache_with(&store, CountingLoader::with_ids(&[5]), settings);

        let shared: SharedStore = store.clone();
        let _holder = DistributedLock::new(shared)
            .try_acquire("record:5", Duration::from_secs(3600))
            .await
            .unwrap();

        match cache.get(5).await {
            Err(CoreError::CacheContention { key, attempts }) => {
                assert_eq!(key, "record:5");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected contention error, got {:?}", other),
        }
        assert_eq!(cache.loader().calls(), 0);
        assert_eq!(cache.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[8]), settings());

        cache.invalidate(8).await.unwrap();

        cache.get(8).await.unwrap();
        cache.invalidate(8).await.unwrap();
        assert!(cache.get_cached(8).await.unwrap().is_none());

        cache.get(8).await.unwrap();
        assert_eq!(cache.loader().calls(), 2);
    }

    #[test]
    fn backoff_stays_within_jitter_band() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(&store, CountingLoader::with_ids(&[]), settings());
        for _ in 0..50 {
            let pause = cache.backoff();
            assert!(pause >= Duration::from_millis(500));
            assert!(pause <= Duration::from_millis(600));
        }
    }
}
