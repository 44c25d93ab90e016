//! Walkthrough of a three-tier waterfall stack.
//!
//! Run with: cargo run --example demo_waterfall

use std::time::Duration;

use cascade_cache::adapters::{LruStorage, MemoryStorage, SegmentedStorage};
use cascade_cache::Cache;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Fastest tier first: bounded LRU, then a sharded byte-cache, then the
    // unbounded map.
    let cache = Cache::new(vec![
        LruStorage::maker(10_000, Duration::from_secs(60)),
        SegmentedStorage::maker(100_000, Duration::from_secs(600)),
        MemoryStorage::maker(Some(Duration::from_secs(3_600))),
    ])?;

    cache.set("user:1", "alice").await?;
    cache
        .batch_set(&[
            ("user:2".to_string(), "bob"),
            ("user:3".to_string(), "carol"),
        ])
        .await?;

    let item = cache.get("user:1").await?;
    let name: String = serde_json::from_slice(&item.value)?;
    info!("user:1 resolved to {}", name);

    let keys = vec!["user:2".to_string(), "user:3".to_string()];
    let items = cache.batch_get(&keys).await?;
    info!("batch get resolved {} keys", items.len());

    cache.del("user:1").await?;
    match cache.get("user:1").await {
        Err(err) => info!("user:1 after delete: {}", err),
        Ok(_) => unreachable!("deleted key should not resolve"),
    }

    for (position, storage) in cache.storages().await?.iter().enumerate() {
        info!("tier {} ttl: {:?}", position, storage.time_to_live());
    }

    Ok(())
}
