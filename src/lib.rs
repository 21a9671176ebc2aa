//! # hms-cache
//!
//! Client-side response cache with request coalescing for the hospital
//! records API (customers, departments, treatments).
//!
//! ## Features
//!
//! - Valid cached responses are served without suspending
//! - Concurrent requests for the same fingerprint share one fetch
//! - Failed fetches are shared with every waiter and never cached
//! - Expired entries are collected by a cancellable background sweep
//! - Explicit `start`/`dispose` lifecycle, no global state
//!
//! ## Usage
//!
//! Endpoint wrappers supply a fingerprint and a fetch function:
//!
//! ```no_run
//! use hms_cache::{CacheConfig, Fingerprint, ResponseCache};
//! use std::sync::Arc;
//!
//! async fn fetch_department(id: u32) -> anyhow::Result<String> {
//!     // transport call goes here
//!     Ok(format!("department {}", id))
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache: Arc<ResponseCache<String>> =
//!         Arc::new(ResponseCache::new(CacheConfig::reference_data())?);
//!     cache.start()?;
//!
//!     let key = Fingerprint::new("/departments").param("id", 3);
//!     let department = cache.request(key, || fetch_department(3)).await?;
//!     println!("{}", department);
//!
//!     println!("{}", cache.stats());
//!     cache.dispose();
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheKey, CacheState, CacheStats, CacheStore, Clock,
    CoalescingRegistry, Fingerprint, GarbageCollector, ManualClock, RequestOptions,
    ResponseCache, SystemClock,
};
pub use error::{CacheError, Result};
