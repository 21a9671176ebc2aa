//! # Response Caching Layer
//!
//! Sits between application call sites and the remote records API.
//!
//! ## Features
//!
//! - **TTL-Based Expiration**: per-entry TTL, checked lazily on read
//! - **Request Coalescing**: at most one in-flight fetch per fingerprint
//! - **Garbage Collection**: periodic sweep of expired entries
//! - **Invalidation**: by key, by prefix, or everything
//! - **Injectable Clock**: deterministic expiration in tests
//!
//! ## Example
//!
//! ```rust
//! use hms_cache::cache::{CacheConfig, Fingerprint, ResponseCache};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .default_ttl(Duration::from_secs(30))
//!     .gc_interval(Duration::from_secs(10))
//!     .build();
//!
//! let cache: ResponseCache<String> = ResponseCache::new(config)?;
//! cache.start()?;
//!
//! let key = Fingerprint::new("/customers").param("id", 42);
//! let customer = cache
//!     .request(key, || async { Ok("{\"id\":42}".to_string()) })
//!     .await?;
//! println!("{}", customer);
//!
//! cache.invalidate_by_prefix("/customers")?;
//! cache.dispose();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod collector;
pub mod config;
pub mod entry;
pub mod facade;
pub mod fingerprint;
pub mod singleflight;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::{GarbageCollector, Sweep};
pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::CacheEntry;
pub use facade::{RequestOptions, ResponseCache};
pub use fingerprint::Fingerprint;
pub use singleflight::{CoalescingRegistry, RegistryStats};
pub use store::{CacheStore, StoreCounters, WriteReservation};
pub use types::{CacheKey, CacheState, CacheStats, RemovalReason};
