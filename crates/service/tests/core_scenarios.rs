use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use usercore_cache::RecordLoader;
use usercore_common::{AppConfig, CoreError, CoreResult, LimitScope};
use usercore_kv::{KvStore, MemoryStore, SharedStore};
use usercore_service::{CoreComponents, UserCore, UserRecord};

/// Stand-in for the user table.
struct UserTable {
    rows: Mutex<HashMap<u64, UserRecord>>,
    reads: AtomicUsize,
    latency: Duration,
}

impl UserTable {
    fn new(latency: Duration) -> Self {
        let mut rows = HashMap::new();
        for (id, name) in [(1u64, "alice"), (2, "bob")] {
            rows.insert(
                id,
                UserRecord {
                    id,
                    username: name.to_string(),
                    email: format!("{}@example.com", name),
                    created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                },
            );
        }
        Self {
            rows: Mutex::new(rows),
            reads: AtomicUsize::new(0),
            latency,
        }
    }
}

struct TableLoader(Arc<UserTable>);

#[async_trait]
impl RecordLoader<UserRecord> for TableLoader {
    async fn load(&self, id: u64) -> CoreResult<Option<UserRecord>> {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.0.latency).await;
        let row = self.0.rows.lock().unwrap().get(&id).cloned();
        Ok(row)
    }
}

fn build(
    store: &Arc<MemoryStore>,
    table: &Arc<UserTable>,
    config: &AppConfig,
) -> Arc<UserCore<TableLoader>> {
    let shared: SharedStore = store.clone();
    let components = CoreComponents::with_store(shared, config);
    Arc::new(UserCore::new(components, TableLoader(Arc::clone(table)), config).unwrap())
}

#[tokio::test(start_paused = true)]
async fn concurrent_profile_misses_load_once() {
    let store = Arc::new(MemoryStore::new());
    let table = Arc::new(UserTable::new(Duration::from_millis(300)));
    let core = build(&store, &table, &AppConfig::default());

    let mut handles = Vec::new();
    for _ in 0..25 {
        let core = Arc::clone(&core);
        handles.push(tokio::spawn(async move { core.profile(1).await }));
    }
    for handle in handles {
        let record = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(record.username, "alice");
    }

    assert_eq!(table.reads.load(Ordering::SeqCst), 1);
    assert!(store.exists("record:1").await.unwrap());
    assert!(!store.exists("lock:record:1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn two_instances_share_one_load() {
    let store = Arc::new(MemoryStore::new());
    let table = Arc::new(UserTable::new(Duration::from_millis(300)));
    let config = AppConfig::default();
    let first = build(&store, &table, &config);
    let second = build(&store, &table, &config);

    let (a, b) = tokio::join!(first.profile(2), second.profile(2));
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(table.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn password_change_invalidates_profile() {
    let store = Arc::new(MemoryStore::new());
    let table = Arc::new(UserTable::new(Duration::ZERO));
    let core = build(&store, &table, &AppConfig::default());

    assert_eq!(core.profile(1).await.unwrap().unwrap().email, "alice@example.com");
    assert_eq!(table.reads.load(Ordering::SeqCst), 1);

    table
        .rows
        .lock()
        .unwrap()
        .get_mut(&1)
        .unwrap()
        .email = "alice@new.example.com".to_string();
    core.invalidate_profile(1).await.unwrap();

    assert_eq!(
        core.profile(1).await.unwrap().unwrap().email,
        "alice@new.example.com"
    );
    assert_eq!(table.reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidating_twice_is_harmless() {
    let store = Arc::new(MemoryStore::new());
    let table = Arc::new(UserTable::new(Duration::ZERO));
    let core = build(&store, &table, &AppConfig::default());

    core.profile(1).await.unwrap();
    core.invalidate_profile(1).await.unwrap();
    core.invalidate_profile(1).await.unwrap();
    core.invalidate_profile(99).await.unwrap();

    assert!(!store.exists("record:1").await.unwrap());
    let text = core.metrics_text().unwrap();
    assert!(text.contains("usercore_cache_invalidation_failures_total 0"));
}

#[tokio::test]
async fn unknown_user_is_not_cached() {
    let store = Arc::new(MemoryStore::new());
    let table = Arc::new(UserTable::new(Duration::ZERO));
    let core = build(&store, &table, &AppConfig::default());

    assert!(core.profile(42).await.unwrap().is_none());
    assert!(core.profile(42).await.unwrap().is_none());
    assert_eq!(table.reads.load(Ordering::SeqCst), 2);
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn store_outage_keeps_admission_open_and_locks_closed() {
    let store = Arc::new(MemoryStore::new());
    let table = Arc::new(UserTable::new(Duration::ZERO));
    let core = build(&store, &table, &AppConfig::default());
    store.set_available(false);

    for _ in 0..10 {
        core.admit("203.0.113.9").await.unwrap();
    }
    assert!(
        !core
            .components()
            .lock
            .acquire("maintenance", Duration::from_secs(5))
            .await
    );

    let err = core.profile(1).await.unwrap_err();
    assert!(err.is_store_failure());
    assert_eq!(table.reads.load(Ordering::SeqCst), 0);

    let health = core.health().await;
    assert!(!health.store_reachable);

    store.set_available(true);
    assert!(core.health().await.store_reachable);
    assert!(core.profile(1).await.unwrap().is_some());
}

#[tokio::test]
async fn global_limit_rejects_with_retry_hint() {
    let store = Arc::new(MemoryStore::new());
    let table = Arc::new(UserTable::new(Duration::ZERO));
    let mut config = AppConfig::default();
    config.rate_limit.global_limit = 5;
    let core = build(&store, &table, &config);

    for _ in 0..5 {
        core.admit("198.51.100.7").await.unwrap();
    }
    match core.admit("198.51.100.7").await {
        Err(CoreError::RateLimited {
            key,
            scope,
            retry_after,
        }) => {
            assert_eq!(key, "198.51.100.7");
            assert_eq!(scope, LimitScope::Global);
            assert_eq!(retry_after, Duration::from_secs(60));
        }
        other => panic!("expected a global rejection, got {:?}", other),
    }
    core.admit("198.51.100.8").await.unwrap();

    let text = core.metrics_text().unwrap();
    assert!(text.contains("usercore_requests_admitted_total 6"));
    assert!(text.contains("usercore_requests_rate_limited_total{scope=\"global\"} 1"));
}
