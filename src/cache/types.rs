//! Core type definitions for the cache system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache key type - a request fingerprint rendered as a string
pub type CacheKey = String;

/// Statistics snapshot for cache monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently held, including expired ones not yet swept
    pub entry_count: usize,

    /// Executions currently in flight
    pub pending_count: usize,

    /// Requests answered from the store
    pub hits: u64,

    /// Requests that went to the coalescing registry
    pub misses: u64,

    /// Fetcher invocations started
    pub fetches: u64,

    /// Requests that joined an execution already in flight
    pub coalesced: u64,

    /// Fetches that settled with an error
    pub fetch_failures: u64,

    /// Entries removed by explicit invalidation or clear
    pub invalidations: u64,

    /// Entries removed by sweeps because their TTL elapsed
    pub evictions_ttl: u64,

    /// Entries removed because the capacity bound was reached
    pub evictions_capacity: u64,

    /// Entries sweeps found stamped after the clock (clock went backwards)
    pub skewed_entries: u64,

    /// Successful fetches whose write was rejected as stale
    pub stale_writes_rejected: u64,

    /// When the last sweep ran
    pub last_sweep_at: Option<DateTime<Utc>>,

    /// When this snapshot was taken
    pub collected_at: DateTime<Utc>,
}

impl CacheStats {
    /// Cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Share of misses that were served by joining an in-flight execution
    pub fn coalescing_rate(&self) -> f64 {
        if self.misses == 0 {
            0.0
        } else {
            (self.coalesced as f64 / self.misses as f64) * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ entries: {}, pending: {}, hits: {}, misses: {}, hit_rate: {:.2}%, fetches: {}, coalesced: {} }}",
            self.entry_count,
            self.pending_count,
            self.hits,
            self.misses,
            self.hit_rate(),
            self.fetches,
            self.coalesced
        )
    }
}

/// Lifecycle of a [`ResponseCache`](crate::cache::ResponseCache)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// Constructed, `start()` not yet called
    Uninitialized,
    /// Serving requests
    Running,
    /// Disposed; terminal
    Stopped,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheState::Uninitialized => write!(f, "uninitialized"),
            CacheState::Running => write!(f, "running"),
            CacheState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Reason an entry left the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalReason {
    /// TTL elapsed and a sweep collected it
    Expired,
    /// Explicit invalidation by key
    Invalidated,
    /// Removed by a prefix invalidation
    PrefixMatch,
    /// Removed by `clear`
    Cleared,
    /// Evicted to respect the capacity bound
    Capacity,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalReason::Expired => write!(f, "TTL expired"),
            RemovalReason::Invalidated => write!(f, "manual invalidation"),
            RemovalReason::PrefixMatch => write!(f, "prefix invalidation"),
            RemovalReason::Cleared => write!(f, "cache cleared"),
            RemovalReason::Capacity => write!(f, "capacity eviction"),
        }
    }
}
