//! Bounded LRU tier.
//!
//! In-memory tier with capacity-based eviction and native TTL expiry,
//! backed by a moka future cache. The backend expires entries itself, so
//! the envelope's `expires_at` stamp is advisory here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};
use crate::storage::{CacheItem, Storage, StorageMaker};

pub struct LruStorage {
    cache: MokaCache<String, Arc<CacheItem>>,
    ttl: Duration,
}

impl LruStorage {
    /// Factory for an LRU tier bounded to `capacity` entries. Capacity and
    /// TTL must both be non-zero.
    pub fn maker(capacity: u64, ttl: Duration) -> StorageMaker {
        Box::new(move || {
            Box::pin(async move { Ok(Arc::new(Self::create(capacity, ttl)?) as Arc<dyn Storage>) })
        })
    }

    fn create(capacity: u64, ttl: Duration) -> CacheResult<Self> {
        if capacity == 0 {
            return Err(CacheError::InvalidConfiguration(
                "lru storage requires a non-zero capacity".into(),
            ));
        }
        if ttl.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "lru storage requires a non-zero ttl".into(),
            ));
        }

        Ok(Self {
            cache: MokaCache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            ttl,
        })
    }

    /// Flush pending eviction bookkeeping; entry counts are eventually
    /// consistent without it.
    #[cfg(test)]
    async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl Storage for LruStorage {
    fn time_to_live(&self) -> Option<Duration> {
        Some(self.ttl)
    }

    async fn get(&self, _ctx: &CancellationToken, key: &str) -> Option<CacheItem> {
        self.cache.get(key).await.map(|item| (*item).clone())
    }

    async fn batch_get(&self, ctx: &CancellationToken, keys: &[String]) -> Vec<CacheItem> {
        let mut results = Vec::new();
        let mut seen = HashSet::new();

        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            if let Some(item) = self.get(ctx, key).await {
                results.push(item);
            }
        }

        results
    }

    async fn set(&self, _ctx: &CancellationToken, key: &str, value: &[u8]) -> CacheResult<()> {
        let item = CacheItem::new(key, value.to_vec(), Some(self.ttl));
        self.cache.insert(key.to_string(), Arc::new(item)).await;
        Ok(())
    }

    async fn batch_set(
        &self,
        ctx: &CancellationToken,
        pairs: &[(String, Vec<u8>)],
    ) -> CacheResult<()> {
        for (key, value) in pairs {
            self.set(ctx, key, value).await?;
        }
        Ok(())
    }

    async fn del(&self, _ctx: &CancellationToken, key: &str) -> CacheResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}
