//! Cache facade: store + coalescing registry behind `request`

use crate::cache::{
    clock::{Clock, SystemClock},
    collector::GarbageCollector,
    config::CacheConfig,
    singleflight::CoalescingRegistry,
    store::{validate_key, CacheStore},
    types::{CacheKey, CacheState, CacheStats},
};
use crate::error::{CacheError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type Outcome<V> = std::result::Result<Arc<V>, CacheError>;
type CacheablePredicate<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Per-request options for [`ResponseCache::request_with`]
pub struct RequestOptions<V> {
    ttl: Option<Duration>,
    cacheable: Option<CacheablePredicate<V>>,
}

impl<V> RequestOptions<V> {
    /// Default TTL, every successful value cacheable
    pub fn new() -> Self {
        Self {
            ttl: None,
            cacheable: None,
        }
    }

    /// Use an explicit TTL instead of the configured default (never jittered)
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Only store values for which `predicate` returns true
    pub fn cacheable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&V) -> bool + Send + Sync + 'static,
    {
        self.cacheable = Some(Arc::new(predicate));
        self
    }
}

impl<V> Default for RequestOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for RequestOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("ttl", &self.ttl)
            .field("cacheable", &self.cacheable.is_some())
            .finish()
    }
}

#[derive(Default)]
struct FetchCounters {
    fetch_failures: AtomicU64,
    stale_writes_rejected: AtomicU64,
}

/// Response cache with request coalescing
///
/// Lifecycle: `new` → `start` → `dispose`. Requests are served only while
/// running; after `dispose` they fail with [`CacheError::Disposed`].
pub struct ResponseCache<V> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    store: Arc<CacheStore<V>>,
    registry: CoalescingRegistry<CacheKey, Outcome<V>>,
    collector: GarbageCollector,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_counters: Arc<FetchCounters>,
}

impl<V> ResponseCache<V>
where
    V: Send + Sync + 'static,
{
    /// Create a cache on the system clock
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a cache reading time from `clock`
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        info!("Initializing response cache with config: {:?}", config);

        let store = Arc::new(CacheStore::new(Arc::clone(&clock), config.max_entries));
        let collector = GarbageCollector::new(store.clone(), Arc::clone(&clock));

        Ok(Self {
            config,
            clock,
            store,
            registry: CoalescingRegistry::new(),
            collector,
            state: Mutex::new(CacheState::Uninitialized),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetch_counters: Arc::new(FetchCounters::default()),
        })
    }

    /// Move to `Running` and start the garbage collector if enabled
    ///
    /// Calling `start` on a running cache is a no-op. Must be called within a
    /// tokio runtime when the collector is enabled.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            CacheState::Running => Ok(()),
            CacheState::Stopped => Err(CacheError::Disposed),
            CacheState::Uninitialized => {
                if self.config.enable_gc {
                    self.collector.start(self.config.gc_interval);
                }
                *state = CacheState::Running;
                info!("Response cache started");
                Ok(())
            }
        }
    }

    /// Stop the garbage collector and move to the terminal `Stopped` state
    ///
    /// Executions already in flight run to completion.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if *state == CacheState::Stopped {
            return;
        }
        self.collector.stop();
        *state = CacheState::Stopped;
        info!("Response cache disposed");
    }

    /// Current lifecycle state
    pub fn state(&self) -> CacheState {
        *self.state.lock()
    }

    /// Whether the periodic collector is scheduled
    pub fn is_collecting(&self) -> bool {
        self.collector.is_running()
    }

    /// The configuration this cache was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Fetch through the cache with the default TTL; every success is cached
    pub async fn request<F, Fut>(&self, key: impl Into<CacheKey>, factory: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.request_with(key, RequestOptions::new(), factory).await
    }

    /// Fetch through the cache
    ///
    /// A valid cached value is returned without suspending and without
    /// calling `factory`. Otherwise the call executes or joins the single
    /// in-flight fetch for `key`. A successful value that passes the
    /// cacheability predicate is stored before any caller is released;
    /// failures are shared with every caller and never stored.
    pub async fn request_with<F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        options: RequestOptions<V>,
        factory: F,
    ) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.ensure_running()?;
        let key = key.into();
        validate_key(&key)?;

        let ttl = options
            .ttl
            .unwrap_or_else(|| self.config.ttl_with_jitter());
        if self.clock.now().checked_add(ttl).is_none() {
            return Err(CacheError::InvalidTtl { key, ttl });
        }

        if let Some(value) = self.store.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit: {}", key);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss: {}", key);

        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.fetch_counters);
        let reject_stale_writes = self.config.reject_stale_writes;
        let cacheable = options.cacheable;
        let fetch_key = key.clone();

        let execution = move || {
            let reservation = reject_stale_writes.then(|| store.reserve(fetch_key.as_str()));
            let fetch = factory();

            async move {
                let value = match fetch.await {
                    Ok(value) => Arc::new(value),
                    Err(cause) => {
                        counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                        debug!("Fetch failed for {}: {:#}", fetch_key, cause);
                        return Err(CacheError::fetch(fetch_key, cause));
                    }
                };

                if cacheable.as_ref().map_or(true, |predicate| predicate(value.as_ref())) {
                    let written = match &reservation {
                        Some(reservation) => reservation.set(Arc::clone(&value), ttl),
                        None => store
                            .set(fetch_key.as_str(), Arc::clone(&value), ttl)
                            .map(|()| true),
                    };

                    match written {
                        Ok(true) => debug!("Cached {} for {:?}", fetch_key, ttl),
                        Ok(false) => {
                            counters.stale_writes_rejected.fetch_add(1, Ordering::Relaxed);
                            debug!("Discarded stale result for {}", fetch_key);
                        }
                        Err(e) => warn!("Failed to cache {}: {}", fetch_key, e),
                    }
                } else {
                    debug!("Result for {} is not cacheable", fetch_key);
                }

                Ok(value)
            }
        };

        self.registry.acquire(key, execution).await?
    }

    /// Peek at a valid cached value without fetching
    pub fn get(&self, key: &str) -> Result<Option<Arc<V>>> {
        self.ensure_running()?;
        Ok(self.store.get(key))
    }

    /// Prime the cache with a value; `None` uses the default TTL
    pub fn insert(&self, key: impl Into<CacheKey>, value: V, ttl: Option<Duration>) -> Result<()> {
        self.ensure_running()?;
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_with_jitter());
        self.store.set(key, Arc::new(value), ttl)
    }

    /// Drop the entry for `key`; returns whether one was present
    ///
    /// An execution already in flight for `key` may still write its result
    /// afterwards unless `reject_stale_writes` is enabled.
    pub fn invalidate(&self, key: &str) -> Result<bool> {
        self.ensure_running()?;
        Ok(self.store.delete(key))
    }

    /// Drop every entry whose key starts with `prefix`
    pub fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.store.delete_by_prefix(prefix))
    }

    /// Drop every entry; executions in flight are left running
    pub fn clear(&self) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.store.clear())
    }

    /// Run a sweep immediately instead of waiting for the collector
    pub fn sweep_now(&self) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.store.sweep(self.clock.now()))
    }

    /// Whether a fetch for `key` is in flight
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.registry.is_pending(&key.to_string())
    }

    /// Snapshot of cache statistics
    pub fn stats(&self) -> CacheStats {
        let store = self.store.counters();
        let registry = self.registry.stats();

        CacheStats {
            entry_count: self.store.len(),
            pending_count: self.registry.pending_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: registry.executions_started,
            coalesced: registry.joins,
            fetch_failures: self.fetch_counters.fetch_failures.load(Ordering::Relaxed),
            invalidations: store.invalidations,
            evictions_ttl: store.evictions_ttl,
            evictions_capacity: store.evictions_capacity,
            skewed_entries: store.skewed_entries,
            stale_writes_rejected: self
                .fetch_counters
                .stale_writes_rejected
                .load(Ordering::Relaxed),
            last_sweep_at: self.store.last_sweep_at(),
            collected_at: Utc::now(),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match *self.state.lock() {
            CacheState::Running => Ok(()),
            CacheState::Uninitialized => Err(CacheError::NotStarted),
            CacheState::Stopped => Err(CacheError::Disposed),
        }
    }
}
