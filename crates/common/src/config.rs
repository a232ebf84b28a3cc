use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Top-level configuration for the shared-state core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Connection settings for the key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Upper bound applied to every individual store call.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_cache_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_miss_retries")]
    pub max_miss_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_cache_ttl_minutes(),
            lock_timeout_ms: default_cache_lock_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_miss_retries: default_max_miss_retries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Refill rate of the per-instance token bucket.
    #[serde(default = "default_local_rps")]
    pub local_rps: u64,
    /// Capacity of the per-instance token bucket.
    #[serde(default = "default_local_burst")]
    pub local_burst: u64,
    /// Requests allowed per client key within one window.
    #[serde(default = "default_global_limit")]
    pub global_limit: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_rate_limit_algorithm")]
    pub algorithm: RateLimitAlgorithm,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_rps: default_local_rps(),
            local_burst: default_local_burst(),
            global_limit: default_global_limit(),
            window_secs: default_window_secs(),
            algorithm: default_rate_limit_algorithm(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    FixedWindow,
    SlidingWindow,
}

// Default value helpers
fn default_store_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_operation_timeout_ms() -> u64 {
    3_000
}
fn default_cache_ttl_minutes() -> u64 {
    10
}
fn default_cache_lock_timeout_ms() -> u64 {
    2_000
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_max_miss_retries() -> u32 {
    10
}
fn default_lock_ttl_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_local_rps() -> u64 {
    100
}
fn default_local_burst() -> u64 {
    30
}
fn default_global_limit() -> u64 {
    50
}
fn default_window_secs() -> u64 {
    60
}
fn default_rate_limit_algorithm() -> RateLimitAlgorithm {
    RateLimitAlgorithm::SlidingWindow
}

impl AppConfig {
    /// Load configuration from a YAML file, apply environment overrides and
    /// validate the result.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override settings from the process environment.
    ///
    /// Recognised variables: `REDIS_HOST`, `REDIS_PORT`, `REDIS_PASSWORD`,
    /// `REDIS_DB` and `CACHE_TTL` (minutes).
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Same as [`Self::apply_env_overrides`] but reads variables through
    /// `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let host = get("REDIS_HOST");
        let port = get("REDIS_PORT");
        let password = get("REDIS_PASSWORD");
        let db = get("REDIS_DB");

        if host.is_some() || port.is_some() || password.is_some() || db.is_some() {
            let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
            let port = port.unwrap_or_else(|| "6379".to_string());
            let db = db.unwrap_or_else(|| "0".to_string());
            self.store.url = match password {
                Some(password) => format!("redis://:{}@{}:{}/{}", password, host, port, db),
                None => format!("redis://{}:{}/{}", host, port, db),
            };
        }

        if let Some(raw) = get("CACHE_TTL") {
            match raw.parse::<u64>() {
                Ok(minutes) => self.cache.ttl_minutes = minutes,
                Err(_) => warn!(value = %raw, "ignoring non-numeric CACHE_TTL"),
            }
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.url.is_empty() {
            anyhow::bail!("store.url must not be empty");
        }
        if self.store.operation_timeout_ms == 0 {
            anyhow::bail!("store.operation_timeout_ms must be greater than zero");
        }
        if self.cache.ttl_minutes == 0 {
            anyhow::bail!("cache.ttl_minutes must be greater than zero");
        }
        if self.cache.lock_timeout_ms == 0 {
            anyhow::bail!("cache.lock_timeout_ms must be greater than zero");
        }
        if self.lock.default_ttl_ms == 0 {
            anyhow::bail!("lock.default_ttl_ms must be greater than zero");
        }

        let rl = &self.rate_limit;
        if rl.enabled {
            if rl.window_secs == 0 {
                anyhow::bail!("rate_limit.window_secs must be greater than zero");
            }
            if rl.global_limit == 0 || rl.local_burst == 0 || rl.local_rps == 0 {
                anyhow::bail!(
                    "rate_limit limits must be greater than zero (local_rps={}, local_burst={}, global_limit={})",
                    rl.local_rps,
                    rl.local_burst,
                    rl.global_limit
                );
            }
        }

        if self.cache.lock_timeout_ms < self.cache.retry_backoff_ms {
            warn!(
                lock_timeout_ms = self.cache.lock_timeout_ms,
                retry_backoff_ms = self.cache.retry_backoff_ms,
                "cache lock timeout is shorter than the miss retry backoff"
            );
        }

        Ok(())
    }
}
