//! Sharded in-process byte-cache tier.
//!
//! Capacity is split across independently locked shards so concurrent
//! operations on different keys rarely contend. Each shard stores the
//! serialized JSON envelope, keeping the tier byte-oriented like its remote
//! counterparts.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::storage::{CacheItem, Storage, StorageMaker};

/// Default shard count; plenty for a process-local tier.
pub const DEFAULT_SHARDS: usize = 16;

pub struct SegmentedStorage {
    shards: Vec<Mutex<LruCache<String, Vec<u8>>>>,
    ttl: Duration,
}

impl SegmentedStorage {
    /// Factory with [`DEFAULT_SHARDS`] shards.
    pub fn maker(capacity: usize, ttl: Duration) -> StorageMaker {
        Self::maker_with_shards(capacity, DEFAULT_SHARDS, ttl)
    }

    /// Factory for a tier of `capacity` total entries spread over `shards`
    /// segments.
    pub fn maker_with_shards(capacity: usize, shards: usize, ttl: Duration) -> StorageMaker {
        Box::new(move || {
            Box::pin(
                async move { Ok(Arc::new(Self::create(capacity, shards, ttl)?) as Arc<dyn Storage>) },
            )
        })
    }

    fn create(capacity: usize, shards: usize, ttl: Duration) -> CacheResult<Self> {
        if shards == 0 {
            return Err(CacheError::InvalidConfiguration(
                "segmented storage requires at least one shard".into(),
            ));
        }
        if capacity < shards {
            return Err(CacheError::InvalidConfiguration(
                "segmented storage capacity must cover every shard".into(),
            ));
        }
        if ttl.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "segmented storage requires a non-zero ttl".into(),
            ));
        }

        let per_shard = NonZeroUsize::new(capacity / shards).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shards)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();

        Ok(Self { shards, ttl })
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, Vec<u8>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn lookup(&self, key: &str) -> Option<CacheItem> {
        let mut shard = self.shard(key).lock();

        let bytes = shard.get(key)?;
        let item: CacheItem = match serde_json::from_slice(bytes) {
            Ok(item) => item,
            Err(err) => {
                debug!("segmented envelope decode for {} failed: {}", key, err);
                shard.pop(key);
                return None;
            }
        };

        if item.is_expired() {
            // The shard lock is already held exclusively; drop in place.
            shard.pop(key);
            return None;
        }

        Some(item)
    }

    fn store(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        let item = CacheItem::new(key, value.to_vec(), Some(self.ttl));
        let bytes = serde_json::to_vec(&item)?;
        self.shard(key).lock().put(key.to_string(), bytes);
        Ok(())
    }
}

#[async_trait]
impl Storage for SegmentedStorage {
    fn time_to_live(&self) -> Option<Duration> {
        Some(self.ttl)
    }

    async fn get(&self, _ctx: &CancellationToken, key: &str) -> Option<CacheItem> {
        self.lookup(key)
    }

    async fn batch_get(&self, _ctx: &CancellationToken, keys: &[String]) -> Vec<CacheItem> {
        let mut results = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            if let Some(item) = self.lookup(key) {
                results.push(item);
            }
        }

        results
    }

    async fn set(&self, _ctx: &CancellationToken, key: &str, value: &[u8]) -> CacheResult<()> {
        self.store(key, value)
    }

    async fn batch_set(
        &self,
        _ctx: &CancellationToken,
        pairs: &[(String, Vec<u8>)],
    ) -> CacheResult<()> {
        for (key, value) in pairs {
            self.store(key, value)?;
        }
        Ok(())
    }

    async fn del(&self, _ctx: &CancellationToken, key: &str) -> CacheResult<()> {
        self.shard(key).lock().pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_set_and_get_roundtrip() {
        let storage = SegmentedStorage::create(64, 4, Duration::from_secs(300)).unwrap();

        storage.set(&ctx(), "k1", b"payload").await.unwrap();

        let item = storage.get(&ctx(), "k1").await.unwrap();
        assert_eq!(item.key, "k1");
        assert_eq!(item.value, b"payload");
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected() {
        assert!(matches!(
            SegmentedStorage::create(64, 0, Duration::from_secs(300)),
            Err(CacheError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            SegmentedStorage::create(4, 16, Duration::from_secs(300)),
            Err(CacheError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            SegmentedStorage::create(64, 4, Duration::ZERO),
            Err(CacheError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_keys_spread_over_shards() {
        let storage = SegmentedStorage::create(1024, 8, Duration::from_secs(300)).unwrap();

        for i in 0..200 {
            let key = format!("key_{}", i);
            storage.set(&ctx(), &key, b"v").await.unwrap();
        }

        let populated = storage
            .shards
            .iter()
            .filter(|shard| shard.lock().len() > 0)
            .count();
        assert!(populated > 1, "expected keys across shards, got {}", populated);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_miss_and_is_removed() {
        let storage = SegmentedStorage::create(64, 4, Duration::from_secs(300)).unwrap();

        let stale = CacheItem {
            key: "stale".to_string(),
            value: b"v".to_vec(),
            expires_at: chrono::Utc::now().timestamp() - 10,
        };
        let bytes = serde_json::to_vec(&stale).unwrap();
        storage.shard("stale").lock().put("stale".to_string(), bytes);

        assert!(storage.get(&ctx(), "stale").await.is_none());
        assert!(storage.shard("stale").lock().peek("stale").is_none());
    }

    #[tokio::test]
    async fn test_per_shard_capacity_evicts_oldest() {
        let storage = SegmentedStorage::create(1, 1, Duration::from_secs(300)).unwrap();

        storage.set(&ctx(), "first", b"1").await.unwrap();
        storage.set(&ctx(), "second", b"2").await.unwrap();

        assert!(storage.get(&ctx(), "first").await.is_none());
        assert!(storage.get(&ctx(), "second").await.is_some());
    }

    #[tokio::test]
    async fn test_del_is_idempotent() {
        let storage = SegmentedStorage::create(64, 4, Duration::from_secs(300)).unwrap();

        storage.set(&ctx(), "k1", b"v").await.unwrap();
        storage.del(&ctx(), "k1").await.unwrap();
        storage.del(&ctx(), "k1").await.unwrap();

        assert!(storage.get(&ctx(), "k1").await.is_none());
    }
}
