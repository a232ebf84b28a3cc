use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use usercore_cache::CacheStatsSnapshot;
use usercore_common::{CoreError, CoreResult};

/// Prometheus metrics collected by the core.
pub struct CoreMetrics {
    pub registry: Registry,
    pub requests_admitted: IntCounter,
    pub requests_rate_limited: IntCounterVec,
    pub profile_lookups: IntCounterVec,
    pub invalidation_failures: IntCounter,
    pub cache_hits: IntGauge,
    pub cache_misses: IntGauge,
    pub cache_loads: IntGauge,
    pub cache_contention_waits: IntGauge,
    pub cache_exhausted: IntGauge,
}

impl CoreMetrics {
    /// Create all counters and gauges and register them against a fresh
    /// registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_admitted = IntCounter::with_opts(Opts::new(
            "usercore_requests_admitted_total",
            "Requests that passed admission control",
        ))?;
        let requests_rate_limited = IntCounterVec::new(
            Opts::new(
                "usercore_requests_rate_limited_total",
                "Requests rejected by admission control",
            ),
            &["scope"],
        )?;
        let profile_lookups = IntCounterVec::new(
            Opts::new(
                "usercore_profile_lookups_total",
                "Profile lookups by outcome",
            ),
            &["outcome"],
        )?;
        let invalidation_failures = IntCounter::with_opts(Opts::new(
            "usercore_cache_invalidation_failures_total",
            "Cache invalidations that could not be applied",
        ))?;

        let cache_hits = IntGauge::new("usercore_cache_hits", "Record cache hits")?;
        let cache_misses = IntGauge::new("usercore_cache_misses", "Record cache misses")?;
        let cache_loads = IntGauge::new(
            "usercore_cache_loads",
            "Authoritative loads performed on cache misses",
        )?;
        let cache_contention_waits = IntGauge::new(
            "usercore_cache_contention_waits",
            "Backoff pauses while another worker repopulated a key",
        )?;
        let cache_exhausted = IntGauge::new(
            "usercore_cache_contention_exhausted",
            "Lookups that gave up waiting for repopulation",
        )?;

        registry.register(Box::new(requests_admitted.clone()))?;
        registry.register(Box::new(requests_rate_limited.clone()))?;
        registry.register(Box::new(profile_lookups.clone()))?;
        registry.register(Box::new(invalidation_failures.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_loads.clone()))?;
        registry.register(Box::new(cache_contention_waits.clone()))?;
        registry.register(Box::new(cache_exhausted.clone()))?;

        Ok(Self {
            registry,
            requests_admitted,
            requests_rate_limited,
            profile_lookups,
            invalidation_failures,
            cache_hits,
            cache_misses,
            cache_loads,
            cache_contention_waits,
            cache_exhausted,
        })
    }

    /// Copy cache counters into the gauges.
    pub fn observe_cache(&self, stats: CacheStatsSnapshot) {
        self.cache_hits.set(stats.hits as i64);
        self.cache_misses.set(stats.misses as i64);
        self.cache_loads.set(stats.loads as i64);
        self.cache_contention_waits.set(stats.contention_waits as i64);
        self.cache_exhausted.set(stats.exhausted as i64);
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn render(&self) -> CoreResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| CoreError::Other(e.into()))?;
        String::from_utf8(buffer).map_err(|e| CoreError::Other(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_metrics() {
        let metrics = CoreMetrics::new().unwrap();
        metrics.requests_admitted.inc();
        metrics
            .requests_rate_limited
            .with_label_values(&["global"])
            .inc_by(3);
        metrics.observe_cache(CacheStatsSnapshot {
            hits: 7,
            ..Default::default()
        });

        let text = metrics.render().unwrap();
        assert!(text.contains("usercore_requests_admitted_total 1"));
        assert!(text.contains("usercore_requests_rate_limited_total{scope=\"global\"} 3"));
        assert!(text.contains("usercore_cache_hits 7"));
    }
}
