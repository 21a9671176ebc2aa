//! Records Cache Demo
//!
//! Simulates endpoint wrappers for customers and departments behind the
//! response cache: concurrent page loads coalesce into one fetch, a failing
//! endpoint is never cached, and an edit invalidates the affected listings.
//!
//! Usage:
//!   cargo run --example records_demo
//!
//! Environment variables:
//!   RUST_LOG                  - log filter (default: info,hms_cache=debug)
//!   HMS_CACHE_DEFAULT_TTL_MS  - default entry TTL in milliseconds
//!   HMS_CACHE_GC_INTERVAL_MS  - collector interval in milliseconds

use anyhow::{bail, Result};
use hms_cache::{CacheConfig, Fingerprint, ResponseCache};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

static REMOTE_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Stand-in for the HTTP transport
async fn fetch_customers(page: u32) -> Result<Value> {
    REMOTE_CALLS.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    Ok(json!({
        "page": page,
        "items": [{ "id": 1, "name": "Ada" }, { "id": 2, "name": "Grace" }],
    }))
}

async fn fetch_department(id: u32) -> Result<Value> {
    REMOTE_CALLS.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    if id == 0 {
        bail!("department {} not found (404)", id);
    }
    Ok(json!({ "id": id, "name": "Cardiology" }))
}

/// Endpoint wrapper: one fingerprint per distinct request
async fn customers_page(cache: &ResponseCache<Value>, page: u32) -> hms_cache::Result<Arc<Value>> {
    let key = Fingerprint::new("/customers").param("page", page);
    cache.request(key, move || fetch_customers(page)).await
}

async fn department(cache: &ResponseCache<Value>, id: u32) -> hms_cache::Result<Arc<Value>> {
    let key = Fingerprint::new("/departments").param("id", id);
    cache.request(key, move || fetch_department(id)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hms_cache=debug")),
        )
        .init();

    info!("=== Records Cache Demo ===");

    let config = CacheConfig::from_env()?;
    let cache = Arc::new(ResponseCache::<Value>::new(config)?);
    cache.start()?;

    info!("\n--- Concurrent page loads ---");
    let loads = (0..5).map(|_| customers_page(&cache, 1));
    for page in futures::future::join_all(loads).await {
        info!("Loaded {}", page?);
    }
    info!("Remote calls so far: {}", REMOTE_CALLS.load(Ordering::SeqCst));

    info!("\n--- Cached read ---");
    let page = customers_page(&cache, 1).await?;
    info!("Served from cache: {}", page);

    info!("\n--- Failing endpoint ---");
    for attempt in 1..=2 {
        match department(&cache, 0).await {
            Ok(value) => info!("Attempt {}: {}", attempt, value),
            Err(e) => info!("Attempt {} failed: {}", attempt, e),
        }
    }
    department(&cache, 4).await?;

    info!("\n--- Edit invalidates listings ---");
    let removed = cache.invalidate_by_prefix("/customers")?;
    info!("Invalidated {} customer entries", removed);
    customers_page(&cache, 1).await?;

    info!("\n--- Statistics ---");
    info!("{}", cache.stats());
    info!("Remote calls: {}", REMOTE_CALLS.load(Ordering::SeqCst));

    cache.dispose();
    Ok(())
}
