//! Process-local map tier.
//!
//! The cheapest tier in a stack: an unbounded map behind a read/write lock,
//! so any number of readers proceed concurrently and writers get exclusive
//! access. The only tier kind that supports the no-expiry mode.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};
use crate::storage::{CacheItem, Storage, StorageMaker};

pub struct MemoryStorage {
    pairs: RwLock<HashMap<String, CacheItem>>,
    ttl: Option<Duration>,
}

impl MemoryStorage {
    /// Factory for a map tier with the given TTL; `None` builds the
    /// no-expiry variant. A zero TTL is rejected.
    pub fn maker(ttl: Option<Duration>) -> StorageMaker {
        Box::new(move || Box::pin(async move { Ok(Arc::new(Self::create(ttl)?) as Arc<dyn Storage>) }))
    }

    fn create(ttl: Option<Duration>) -> CacheResult<Self> {
        if ttl == Some(Duration::ZERO) {
            return Err(CacheError::InvalidConfiguration(
                "memory storage requires a non-zero ttl".into(),
            ));
        }

        Ok(Self {
            pairs: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// Drop entries observed as expired during a read. Runs after the read
    /// guard is released: deleting under the read lock would deadlock.
    async fn remove_expired(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }

        let mut pairs = self.pairs.write().await;
        let now = chrono::Utc::now().timestamp();
        for key in keys {
            // Re-check: a writer may have refreshed the entry in between.
            if pairs.get(key).is_some_and(|item| item.is_expired_at(now)) {
                pairs.remove(key);
            }
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn time_to_live(&self) -> Option<Duration> {
        self.ttl
    }

    async fn get(&self, _ctx: &CancellationToken, key: &str) -> Option<CacheItem> {
        let (item, expired) = {
            let pairs = self.pairs.read().await;
            match pairs.get(key) {
                // Returned by value: callers must not be able to mutate the
                // stored envelope through the result.
                Some(item) if !item.is_expired() => (Some(item.clone()), None),
                Some(_) => (None, Some(key.to_string())),
                None => (None, None),
            }
        };

        if let Some(key) = expired {
            self.remove_expired(&[key]).await;
        }

        item
    }

    async fn batch_get(&self, _ctx: &CancellationToken, keys: &[String]) -> Vec<CacheItem> {
        let mut results = Vec::new();
        let mut expired = Vec::new();

        {
            let pairs = self.pairs.read().await;
            let now = chrono::Utc::now().timestamp();
            let mut seen = HashSet::new();

            for key in keys {
                if !seen.insert(key.as_str()) {
                    continue;
                }
                match pairs.get(key) {
                    Some(item) if !item.is_expired_at(now) => results.push(item.clone()),
                    Some(_) => expired.push(key.clone()),
                    None => {}
                }
            }
        }

        self.remove_expired(&expired).await;
        results
    }

    async fn set(&self, _ctx: &CancellationToken, key: &str, value: &[u8]) -> CacheResult<()> {
        let item = CacheItem::new(key, value.to_vec(), self.ttl);
        self.pairs.write().await.insert(key.to_string(), item);
        Ok(())
    }

    async fn batch_set(
        &self,
        _ctx: &CancellationToken,
        pairs: &[(String, Vec<u8>)],
    ) -> CacheResult<()> {
        let mut guard = self.pairs.write().await;
        for (key, value) in pairs {
            guard.insert(key.clone(), CacheItem::new(key.clone(), value.clone(), self.ttl));
        }
        Ok(())
    }

    async fn del(&self, _ctx: &CancellationToken, key: &str) -> CacheResult<()> {
        self.pairs.write().await.remove(key);
        Ok(())
    }
}
