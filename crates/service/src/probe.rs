use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use usercore_common::AppConfig;
use usercore_kv::{KvStore, SharedStore};
use usercore_rate_limit::RateLimitDecision;

use crate::CoreComponents;

const PROBE_LOCK_KEY: &str = "doctor:probe";
const PROBE_CLIENT: &str = "doctor";

/// Reachability of the key-value store, as reported by the health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store_reachable: bool,
    pub store_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store_reachable
    }
}

/// Result of exercising every shared-state component once.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub health: HealthReport,
    pub lock_round_trip: bool,
    pub rate_limit_allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_scope: Option<String>,
}

/// Ping the store and time the round trip.
pub async fn probe_store(store: &SharedStore) -> HealthReport {
    let started = Instant::now();
    let result = store.ping().await;
    let store_latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => HealthReport {
            store_reachable: true,
            store_latency_ms,
            error: None,
        },
        Err(e) => {
            warn!(error = %e, "store health check failed");
            HealthReport {
                store_reachable: false,
                store_latency_ms,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Ping the store, take and release a lock, and run one admission check.
pub async fn run_probes(components: &CoreComponents, config: &AppConfig) -> ProbeReport {
    let health = probe_store(&components.store).await;

    let lock_round_trip = match components
        .lock
        .try_acquire(PROBE_LOCK_KEY, config.lock.default_ttl())
        .await
    {
        Some(guard) => {
            guard.release().await;
            true
        }
        None => false,
    };

    let (rate_limit_allowed, rate_limit_scope) =
        match components.rate_limiter.check(PROBE_CLIENT).await {
            RateLimitDecision::Allowed => (true, None),
            RateLimitDecision::Rejected { scope, .. } => (false, Some(scope.to_string())),
        };

    info!(
        store_reachable = health.store_reachable,
        store_latency_ms = health.store_latency_ms,
        lock_round_trip,
        rate_limit_allowed,
        "probes finished"
    );

    ProbeReport {
        health,
        lock_round_trip,
        rate_limit_allowed,
        rate_limit_scope,
    }
}
