//! Wiring of the shared-state core for the user-account service.
//!
//! [`CoreComponents`] builds the store handle, lock and rate limiter from
//! configuration; [`UserCore`] adds the profile cache and exposes the
//! operations request handlers use: admission, profile lookup, profile
//! invalidation after a write, health and metrics.

pub mod metrics;
pub mod probe;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use usercore_cache::{CacheSettings, RecordLoader, StampedeProtectedCache};
use usercore_common::{AppConfig, CoreError, CoreResult};
use usercore_kv::{KvStore, RedisStore, SharedStore, TimeoutStore};
use usercore_lock::DistributedLock;
use usercore_rate_limit::RateLimiter;

pub use crate::metrics::CoreMetrics;
pub use crate::probe::{probe_store, run_probes, HealthReport, ProbeReport};

/// Cached snapshot of a user account. Credentials are never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Components sharing one injected store handle.
#[derive(Clone)]
pub struct CoreComponents {
    pub store: SharedStore,
    pub lock: DistributedLock,
    pub rate_limiter: RateLimiter,
}

impl CoreComponents {
    pub fn with_store(store: SharedStore, config: &AppConfig) -> Self {
        Self {
            lock: DistributedLock::new(Arc::clone(&store)),
            rate_limiter: RateLimiter::from_config(Arc::clone(&store), &config.rate_limit),
            store,
        }
    }

    /// Connect to Redis and bound every call by the configured operation
    /// timeout.
    pub async fn connect(config: &AppConfig) -> CoreResult<Self> {
        let redis = RedisStore::connect(&config.store.url, config.store.connect_timeout()).await?;
        let store: SharedStore = Arc::new(TimeoutStore::new(
            redis,
            config.store.operation_timeout(),
        ));
        store.ping().await?;
        info!(
            operation_timeout_ms = config.store.operation_timeout_ms,
            "key-value store ready"
        );
        Ok(Self::with_store(store, config))
    }
}

pub struct UserCore<L> {
    components: CoreComponents,
    cache: Arc<StampedeProtectedCache<UserRecord, L>>,
    metrics: Arc<CoreMetrics>,
}

impl<L: RecordLoader<UserRecord>> UserCore<L> {
    pub fn new(components: CoreComponents, loader: L, config: &AppConfig) -> CoreResult<Self> {
        let cache = StampedeProtectedCache::new(
            Arc::clone(&components.store),
            components.lock.clone(),
            loader,
            CacheSettings::from(&config.cache),
        );
        let metrics = CoreMetrics::new().map_err(|e| CoreError::Other(e.into()))?;

        Ok(Self {
            components,
            cache: Arc::new(cache),
            metrics: Arc::new(metrics),
        })
    }

    pub fn components(&self) -> &CoreComponents {
        &self.components
    }

    pub fn cache(&self) -> &StampedeProtectedCache<UserRecord, L> {
        &self.cache
    }

    /// Admission check for a request from `client_ip`.
    ///
    /// A rejection is reported as [`CoreError::RateLimited`].
    pub async fn admit(&self, client_ip: &str) -> CoreResult<()> {
        match self.components.rate_limiter.enforce(client_ip).await {
            Ok(()) => {
                self.metrics.requests_admitted.inc();
                Ok(())
            }
            Err(CoreError::RateLimited {
                key,
                scope,
                retry_after,
            }) => {
                self.metrics
                    .requests_rate_limited
                    .with_label_values(&[scope.as_str()])
                    .inc();
                Err(CoreError::RateLimited {
                    key,
                    scope,
                    retry_after,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Profile of an authenticated user, served from the cache when possible.
    pub async fn profile(&self, user_id: u64) -> CoreResult<Option<UserRecord>> {
        let result = self.cache.get(user_id).await;
        let outcome = match &result {
            Ok(Some(_)) => "found",
            Ok(None) => "not_found",
            Err(e) if e.is_store_failure() => "store_error",
            Err(_) => "error",
        };
        self.metrics
            .profile_lookups
            .with_label_values(&[outcome])
            .inc();
        result
    }

    /// Drop the cached profile of `user_id` after its authoritative record
    /// changed (e.g. a password update).
    ///
    /// Runs in the background; failures are logged and counted, not retried.
    pub fn invalidate_profile(&self, user_id: u64) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            if let Err(e) = cache.invalidate(user_id).await {
                metrics.invalidation_failures.inc();
                warn!(user_id, error = %e, "failed to invalidate profile cache");
            }
        })
    }

    pub async fn health(&self) -> HealthReport {
        probe_store(&self.components.store).await
    }

    /// Current metrics in the Prometheus text format.
    pub fn metrics_text(&self) -> CoreResult<String> {
        self.metrics.observe_cache(self.cache.stats());
        self.metrics.render()
    }
}
