//! Key/value store with per-entry expiration
//!
//! Reads check validity lazily and never mutate; expired entries stay in the
//! map until a sweep collects them.

use crate::cache::{
    clock::Clock,
    collector::Sweep,
    entry::CacheEntry,
    types::{CacheKey, RemovalReason},
};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Removal counters kept by the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub invalidations: u64,
    pub evictions_ttl: u64,
    pub evictions_capacity: u64,
    /// Entries a sweep found stamped after the store's clock
    pub skewed_entries: u64,
}

/// TTL store shared by the facade and the garbage collector
pub struct CacheStore<V> {
    clock: Arc<dyn Clock>,
    max_entries: Option<usize>,
    inner: RwLock<StoreInner<V>>,
}

struct StoreInner<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,

    /// Insertion order as `(seq, key)`; stale pairs are skipped on eviction
    insertion_order: VecDeque<(u64, CacheKey)>,

    next_seq: u64,

    /// Keys with a reserved write; invalidations bump their generation
    reservations: HashMap<CacheKey, Reservation>,

    counters: StoreCounters,

    last_sweep_at: Option<DateTime<Utc>>,
}

struct Reservation {
    generation: u64,
    holders: usize,
}

impl<V> CacheStore<V> {
    /// Create a store reading time from `clock`, optionally bounded to `max_entries`
    pub fn new(clock: Arc<dyn Clock>, max_entries: Option<usize>) -> Self {
        Self {
            clock,
            max_entries,
            inner: RwLock::new(StoreInner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                next_seq: 0,
                reservations: HashMap::new(),
                counters: StoreCounters::default(),
                last_sweep_at: None,
            }),
        }
    }

    /// The clock this store checks validity against
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Get a value if a valid entry exists
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.clock.now();
        let inner = self.inner.read();

        inner
            .entries
            .get(key)
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Whether a valid entry exists for `key`
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Store a value, overwriting any existing entry
    ///
    /// A zero TTL stores nothing and drops the existing entry, since such an
    /// entry could never be read back.
    pub fn set(&self, key: impl Into<CacheKey>, value: Arc<V>, ttl: Duration) -> Result<()> {
        let key = key.into();
        let now = self.checked_now(&key, ttl)?;
        let mut inner = self.inner.write();
        self.insert_locked(&mut inner, key, value, now, ttl);
        Ok(())
    }

    /// Reserve a write to `key` that an invalidation of `key` can cancel
    ///
    /// The reservation sees `delete`, `delete_by_prefix` and `clear` calls
    /// that touch `key` after this point. Invalidations of other keys do not
    /// affect it.
    pub fn reserve(self: &Arc<Self>, key: impl Into<CacheKey>) -> WriteReservation<V> {
        let key = key.into();
        let generation = {
            let mut inner = self.inner.write();
            let reservation = inner
                .reservations
                .entry(key.clone())
                .or_insert(Reservation {
                    generation: 0,
                    holders: 0,
                });
            reservation.holders += 1;
            reservation.generation
        };

        WriteReservation {
            store: Arc::clone(self),
            key,
            generation,
        }
    }

    /// Remove an entry; returns whether one was present
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        if let Some(reservation) = inner.reservations.get_mut(key) {
            reservation.generation += 1;
        }

        let removed = inner.entries.remove(key).is_some();
        if removed {
            inner.counters.invalidations += 1;
            debug!("Removed cache entry {} ({})", key, RemovalReason::Invalidated);
        }
        removed
    }

    /// Remove every key starting with `prefix`; returns the number removed
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.write();
        inner
            .reservations
            .iter_mut()
            .filter(|(key, _)| key.starts_with(prefix))
            .for_each(|(_, reservation)| reservation.generation += 1);

        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - inner.entries.len();

        inner.counters.invalidations += removed as u64;
        if removed > 0 {
            info!(
                "Removed {} entries under {:?} ({})",
                removed,
                prefix,
                RemovalReason::PrefixMatch
            );
        }
        removed
    }

    /// Drop every entry; returns the number removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        inner
            .reservations
            .values_mut()
            .for_each(|reservation| reservation.generation += 1);

        let removed = inner.entries.len();
        inner.entries.clear();
        inner.insertion_order.clear();
        inner.counters.invalidations += removed as u64;

        info!("Cleared {} entries from cache ({})", removed, RemovalReason::Cleared);
        removed
    }

    /// Remove every entry with `inserted_at + ttl <= now`; returns the number removed
    ///
    /// The store's clock is read again under the write lock and the later of
    /// the two instants is used, so a write that lands between the caller's
    /// clock read and the sweep is never seen as coming from the future.
    /// Entries still stamped after that instant mean the clock went backwards;
    /// they are kept (reads treat them as fresh), logged and counted.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.write();
        let now = now.max(self.clock.now());
        let mut expired = 0usize;
        let mut skewed = 0usize;

        inner.entries.retain(|key, entry| {
            if entry.is_from_future(now) {
                warn!(
                    "Cache entry {} is stamped {:?} after sweep time; keeping it",
                    key,
                    entry.inserted_at - now
                );
                skewed += 1;
                true
            } else if entry.is_expired_at(now) {
                expired += 1;
                false
            } else {
                true
            }
        });

        inner.counters.evictions_ttl += expired as u64;
        inner.counters.skewed_entries += skewed as u64;
        inner.last_sweep_at = Some(Utc::now());
        Self::compact_order(&mut inner);

        if expired > 0 {
            debug!("Swept {} entries ({})", expired, RemovalReason::Expired);
        }
        expired
    }

    /// Number of entries held, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the store holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Snapshot of removal counters
    pub fn counters(&self) -> StoreCounters {
        self.inner.read().counters
    }

    /// When the last sweep ran
    pub fn last_sweep_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_sweep_at
    }

    fn checked_now(&self, key: &str, ttl: Duration) -> Result<Instant> {
        validate_key(key)?;
        let now = self.clock.now();
        if now.checked_add(ttl).is_none() {
            return Err(CacheError::InvalidTtl {
                key: key.to_string(),
                ttl,
            });
        }
        Ok(now)
    }

    fn insert_locked(
        &self,
        inner: &mut StoreInner<V>,
        key: CacheKey,
        value: Arc<V>,
        now: Instant,
        ttl: Duration,
    ) {
        if ttl.is_zero() {
            inner.entries.remove(&key);
            return;
        }

        if !inner.entries.contains_key(&key) {
            self.evict_if_needed(inner);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut entry = CacheEntry::new(value, now, ttl);
        entry.seq = seq;
        inner.entries.insert(key.clone(), entry);
        inner.insertion_order.push_back((seq, key));

        if inner.insertion_order.len() > 2 * inner.entries.len() + 16 {
            Self::compact_order(inner);
        }
    }

    fn evict_if_needed(&self, inner: &mut StoreInner<V>) {
        let Some(max) = self.max_entries else {
            return;
        };

        while inner.entries.len() >= max {
            let Some((seq, key)) = inner.insertion_order.pop_front() else {
                break;
            };
            let live = inner.entries.get(&key).is_some_and(|e| e.seq == seq);
            if live {
                inner.entries.remove(&key);
                inner.counters.evictions_capacity += 1;
                debug!("Evicted cache entry {} ({})", key, RemovalReason::Capacity);
            }
        }
    }

    fn compact_order(inner: &mut StoreInner<V>) {
        let StoreInner {
            entries,
            insertion_order,
            ..
        } = inner;
        insertion_order.retain(|(seq, key)| entries.get(key).is_some_and(|e| e.seq == *seq));
    }
}

/// A pending write to one key, cancelled by invalidations of that key
///
/// Created by [`CacheStore::reserve`]; released on drop.
pub struct WriteReservation<V> {
    store: Arc<CacheStore<V>>,
    key: CacheKey,
    generation: u64,
}

impl<V> WriteReservation<V> {
    /// Key this reservation covers
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether no invalidation of the key happened since the reservation
    pub fn is_current(&self) -> bool {
        self.store
            .inner
            .read()
            .reservations
            .get(&self.key)
            .is_some_and(|r| r.generation == self.generation)
    }

    /// Store the value unless the key was invalidated since the reservation
    ///
    /// Returns `Ok(false)` when the write was rejected as stale.
    pub fn set(&self, value: Arc<V>, ttl: Duration) -> Result<bool> {
        let now = self.store.checked_now(&self.key, ttl)?;
        let mut inner = self.store.inner.write();

        let current = inner
            .reservations
            .get(&self.key)
            .is_some_and(|r| r.generation == self.generation);
        if !current {
            debug!("Rejecting stale write for {}", self.key);
            return Ok(false);
        }

        self.store
            .insert_locked(&mut inner, self.key.clone(), value, now, ttl);
        Ok(true)
    }
}

impl<V> Drop for WriteReservation<V> {
    fn drop(&mut self) {
        let mut inner = self.store.inner.write();
        let released = match inner.reservations.get_mut(&self.key) {
            Some(reservation) => {
                reservation.holders -= 1;
                reservation.holders == 0
            }
            None => false,
        };
        if released {
            inner.reservations.remove(&self.key);
        }
    }
}

impl<V: Send + Sync> Sweep for CacheStore<V> {
    fn sweep(&self, now: Instant) -> usize {
        CacheStore::sweep(self, now)
    }
}

/// Reject keys that cannot serve as fingerprints
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    fn store(max_entries: Option<usize>) -> (Arc<ManualClock>, CacheStore<String>) {
        let clock = Arc::new(ManualClock::new());
        let store = CacheStore::new(clock.clone(), max_entries);
        (clock, store)
    }

    fn v(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    #[test]
    fn test_set_and_get() {
        let (clock, store) = store(None);
        store.set("/a", v("x1"), Duration::from_millis(5000)).unwrap();

        clock.advance(Duration::from_millis(100));
        assert_eq!(store.get("/a").as_deref(), Some(&"x1".to_string()));

        clock.advance(Duration::from_millis(5900));
        assert_eq!(store.get("/a"), None);
    }

    #[test]
    fn test_get_does_not_delete_expired() {
        let (clock, store) = store(None);
        store.set("/a", v("x"), Duration::from_secs(1)).unwrap();

        clock.advance(Duration::from_secs(2));
        assert!(store.get("/a").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_overwrite() {
        let (_clock, store) = store(None);
        store.set("/a", v("old"), Duration::from_secs(10)).unwrap();
        store.set("/a", v("new"), Duration::from_secs(10)).unwrap();

        assert_eq!(store.get("/a").as_deref(), Some(&"new".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_zero_ttl_stores_nothing() {
        let (_clock, store) = store(None);
        store.set("/a", v("x"), Duration::from_secs(10)).unwrap();
        store.set("/a", v("y"), Duration::ZERO).unwrap();

        assert!(store.get("/a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_key_and_ttl() {
        let (_clock, store) = store(None);

        let err = store.set("  ", v("x"), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey(_)));

        let err = store.set("/a", v("x"), Duration::MAX).unwrap_err();
        assert!(matches!(err, CacheError::InvalidTtl { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete() {
        let (_clock, store) = store(None);
        store.set("/a", v("x"), Duration::from_secs(10)).unwrap();

        assert!(store.delete("/a"));
        assert!(!store.delete("/a"));
        assert!(store.get("/a").is_none());
        assert_eq!(store.counters().invalidations, 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (clock, store) = store(None);
        store.set("a", v("1"), Duration::from_secs(1)).unwrap();
        store.set("b", v("2"), Duration::from_secs(60)).unwrap();

        clock.advance(Duration::from_secs(1));
        let removed = store.sweep(clock.now());

        assert_eq!(removed, 1);
        assert!(store.get("b").is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.counters().evictions_ttl, 1);
        assert!(store.last_sweep_at().is_some());
    }

    #[test]
    fn test_sweep_keeps_write_racing_the_clock_read() {
        let (clock, store) = store(None);

        // The collector read the clock, then a write landed before the sweep
        // took the lock.
        let sweep_time = clock.now();
        clock.advance(Duration::from_millis(1));
        store.set("/fresh", v("1"), Duration::from_secs(60)).unwrap();

        assert_eq!(store.sweep(sweep_time), 0);
        assert!(store.get("/fresh").is_some());
        assert_eq!(store.counters().skewed_entries, 0);
    }

    #[test]
    fn test_sweep_keeps_entries_after_clock_moves_back() {
        let (clock, store) = store(None);
        let t0 = clock.now();
        clock.advance(Duration::from_secs(10));
        store.set("late", v("1"), Duration::from_secs(60)).unwrap();

        clock.set(t0);
        assert_eq!(store.sweep(clock.now()), 0);
        assert!(store.get("late").is_some());
        assert_eq!(store.counters().skewed_entries, 1);
    }

    #[test]
    fn test_delete_by_prefix() {
        let (_clock, store) = store(None);
        let ttl = Duration::from_secs(60);
        store.set("/customers/1", v("c1"), ttl).unwrap();
        store.set("/customers/2", v("c2"), ttl).unwrap();
        store.set("/departments/1", v("d1"), ttl).unwrap();

        assert_eq!(store.delete_by_prefix("/customers"), 2);
        assert!(store.get("/customers/1").is_none());
        assert!(store.get("/customers/2").is_none());
        assert!(store.get("/departments/1").is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest_inserted() {
        let (_clock, store) = store(Some(2));
        let ttl = Duration::from_secs(60);
        store.set("k1", v("1"), ttl).unwrap();
        store.set("k2", v("2"), ttl).unwrap();
        // Overwriting an existing key never evicts.
        store.set("k1", v("1b"), ttl).unwrap();
        assert_eq!(store.len(), 2);

        store.set("k3", v("3"), ttl).unwrap();
        assert!(store.get("k2").is_none());
        assert!(store.get("k1").is_some());
        assert!(store.get("k3").is_some());
        assert_eq!(store.counters().evictions_capacity, 1);
    }

    #[test]
    fn test_reservation_rejects_write_after_invalidation() {
        let (_clock, store) = store(None);
        let store = Arc::new(store);
        let ttl = Duration::from_secs(60);

        let reservation = store.reserve("/a");
        assert!(reservation.set(v("1"), ttl).unwrap());

        store.delete("/a");
        assert!(!reservation.is_current());
        assert!(!reservation.set(v("2"), ttl).unwrap());
        assert!(store.get("/a").is_none());

        // A reservation taken after the invalidation writes normally.
        let fresh = store.reserve("/a");
        assert!(fresh.set(v("3"), ttl).unwrap());
    }

    #[test]
    fn test_reservation_ignores_unrelated_invalidations() {
        let (_clock, store) = store(None);
        let store = Arc::new(store);
        let ttl = Duration::from_secs(60);

        let customer = store.reserve("/customers/1");
        let department = store.reserve("/departments/9");

        store.delete("/departments/9");
        assert!(customer.set(v("c"), ttl).unwrap());
        assert!(!department.set(v("d"), ttl).unwrap());

        let customer = store.reserve("/customers/2");
        let department = store.reserve("/departments/3");
        assert_eq!(store.delete_by_prefix("/customers"), 1);
        assert!(!customer.is_current());
        assert!(department.is_current());

        store.clear();
        assert!(!department.is_current());
    }

    #[test]
    fn test_reservations_are_released_on_drop() {
        let (_clock, store) = store(None);
        let store = Arc::new(store);

        let first = store.reserve("/a");
        let second = store.reserve("/a");
        drop(first);
        assert_eq!(store.inner.read().reservations.len(), 1);
        drop(second);
        assert!(store.inner.read().reservations.is_empty());
    }

    #[test]
    fn test_clear() {
        let (_clock, store) = store(None);
        store.set("a", v("1"), Duration::from_secs(60)).unwrap();
        store.set("b", v("2"), Duration::from_secs(60)).unwrap();

        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert_eq!(store.counters().invalidations, 2);
    }

    #[test]
    fn test_concurrent_reads_during_sweep() {
        let (clock, store) = store(None);
        let store = Arc::new(store);
        for i in 0..200 {
            let ttl = Duration::from_secs(if i % 2 == 0 { 1 } else { 60 });
            store.set(format!("k{}", i), v("x"), ttl).unwrap();
        }
        clock.advance(Duration::from_secs(2));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let hit = store.get(&format!("k{}", i));
                        if i % 2 == 1 {
                            assert!(hit.is_some());
                        }
                    }
                })
            })
            .collect();

        let removed = store.sweep(clock.now());
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(removed, 100);
        assert_eq!(store.len(), 100);
    }
}
