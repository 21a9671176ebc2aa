//! Configuration for the response cache

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the response cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a request does not name one
    pub default_ttl: Duration,

    /// Interval between garbage collection sweeps
    pub gc_interval: Duration,

    /// Optional capacity bound; oldest-inserted entries are evicted first
    pub max_entries: Option<usize>,

    /// TTL jitter factor (0.0 - 1.0), applied to the default TTL only
    pub ttl_jitter: f64,

    /// Run the periodic garbage collector while the cache is started
    pub enable_gc: bool,

    /// Reject writes from executions that were overtaken by an invalidation
    pub reject_stale_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            max_entries: None,
            ttl_jitter: 0.0,
            enable_gc: true,
            reject_stale_writes: false,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(CacheError::ConfigError(
                "default_ttl must be greater than 0".to_string(),
            ));
        }

        if self.gc_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "gc_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_entries == Some(0) {
            return Err(CacheError::ConfigError(
                "max_entries must be greater than 0 when set".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Default TTL with jitter applied
    ///
    /// Falls back to the unjittered TTL when the jittered value cannot be
    /// represented as a `Duration`.
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.default_ttl;
        }

        let base_ms = self.default_ttl.as_secs_f64() * 1000.0;
        let jitter_range = base_ms * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_ms = (base_ms + jitter).max(1.0);

        Duration::try_from_secs_f64(final_ms / 1000.0).unwrap_or(self.default_ttl)
    }

    /// Load configuration from the environment, reading a `.env` file if present
    ///
    /// Unset variables keep their defaults. Durations are in milliseconds.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = Self::builder();

        if let Some(ms) = env_parse::<u64>("HMS_CACHE_DEFAULT_TTL_MS")? {
            builder = builder.default_ttl(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("HMS_CACHE_GC_INTERVAL_MS")? {
            builder = builder.gc_interval(Duration::from_millis(ms));
        }
        if let Some(max) = env_parse::<usize>("HMS_CACHE_MAX_ENTRIES")? {
            builder = builder.max_entries(max);
        }
        if let Some(jitter) = env_parse::<f64>("HMS_CACHE_TTL_JITTER")? {
            builder = builder.ttl_jitter(jitter);
        }
        if let Some(enable) = env_parse::<bool>("HMS_CACHE_ENABLE_GC")? {
            builder = builder.enable_gc(enable);
        }
        if let Some(reject) = env_parse::<bool>("HMS_CACHE_REJECT_STALE_WRITES")? {
            builder = builder.reject_stale_writes(reject);
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CacheError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    gc_interval: Option<Duration>,
    max_entries: Option<usize>,
    ttl_jitter: Option<f64>,
    enable_gc: Option<bool>,
    reject_stale_writes: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set garbage collection interval
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = Some(interval);
        self
    }

    /// Bound the number of cache entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable the periodic garbage collector
    pub fn enable_gc(mut self, enable: bool) -> Self {
        self.enable_gc = Some(enable);
        self
    }

    /// Enable or disable stale-write rejection
    pub fn reject_stale_writes(mut self, reject: bool) -> Self {
        self.reject_stale_writes = Some(reject);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            gc_interval: self.gc_interval.unwrap_or(defaults.gc_interval),
            max_entries: self.max_entries.or(defaults.max_entries),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_gc: self.enable_gc.unwrap_or(defaults.enable_gc),
            reject_stale_writes: self
                .reject_stale_writes
                .unwrap_or(defaults.reject_stale_writes),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Short-lived data such as appointment slots and ward occupancy
    pub fn realtime() -> Self {
        Self {
            default_ttl: Duration::from_secs(5),
            gc_interval: Duration::from_secs(5),
            max_entries: Some(5_000),
            ttl_jitter: 0.1,
            ..Default::default()
        }
    }

    /// Slow-moving reference data such as department and treatment catalogs
    pub fn reference_data() -> Self {
        Self {
            default_ttl: Duration::from_secs(15 * 60),
            gc_interval: Duration::from_secs(60),
            max_entries: Some(1_000),
            ttl_jitter: 0.05,
            ..Default::default()
        }
    }
}
