//! Cache entry with TTL bookkeeping

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A stored value with its insertion time and TTL
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// The cached value, shared with every reader
    pub value: Arc<V>,

    /// When the entry was written
    pub inserted_at: Instant,

    /// How long the entry stays valid
    pub ttl: Duration,

    /// Insertion sequence number, used for oldest-first eviction
    pub(crate) seq: u64,
}

impl<V> CacheEntry<V> {
    /// Create a new entry
    pub fn new(value: Arc<V>, inserted_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at,
            ttl,
            seq: 0,
        }
    }

    /// Valid iff `now - inserted_at < ttl`; a zero TTL is never valid
    pub fn is_valid_at(&self, now: Instant) -> bool {
        match now.checked_duration_since(self.inserted_at) {
            Some(age) => age < self.ttl,
            // Written after `now` (clock skew): treat as fresh.
            None => !self.ttl.is_zero(),
        }
    }

    /// Whether a sweep at `now` should collect this entry (`inserted_at + ttl <= now`)
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.inserted_at.checked_add(self.ttl) {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }

    /// Whether the entry claims to be written after `now`
    pub fn is_from_future(&self, now: Instant) -> bool {
        self.inserted_at > now
    }

    /// Time left until expiry, if any
    pub fn time_until_expiration(&self, now: Instant) -> Option<Duration> {
        let expires_at = self.inserted_at.checked_add(self.ttl)?;
        let left = expires_at.checked_duration_since(now)?;
        (!left.is_zero()).then_some(left)
    }
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
            ttl: self.ttl,
            seq: self.seq,
        }
    }
}
