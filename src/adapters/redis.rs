//! Remote KV tier.
//!
//! Talks to a Redis-compatible server through a shared connection manager
//! (the pool lives inside the handle, which is cheap to clone per call).
//! The server expires entries natively: every write carries a `PX` expiry
//! equal to the tier TTL, and the envelope's own stamp is advisory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::retry::with_retry;
use crate::storage::{dedupe_keys, CacheItem, Storage, StorageMaker};

/// Keys fetched per MGET round-trip.
const MAX_READ_OPS: usize = 200;
/// Pairs written per pipelined round-trip.
const MAX_WRITE_OPS: usize = 200;

pub struct RedisStorage {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisStorage {
    /// Factory over a shared connection manager. A zero TTL is rejected.
    pub fn maker(conn: ConnectionManager, ttl: Duration) -> StorageMaker {
        Box::new(move || {
            Box::pin(async move { Ok(Arc::new(Self::create(conn, ttl)?) as Arc<dyn Storage>) })
        })
    }

    fn create(conn: ConnectionManager, ttl: Duration) -> CacheResult<Self> {
        if ttl.is_zero() {
            return Err(CacheError::InvalidConfiguration(
                "redis storage requires a non-zero ttl".into(),
            ));
        }

        Ok(Self { conn, ttl })
    }

    /// Remove every key in one round-trip. Absent keys are ignored.
    pub async fn batch_del(&self, _ctx: &CancellationToken, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }

        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(CacheError::backend)
    }

    fn envelope(&self, key: &str, value: &[u8]) -> CacheResult<Vec<u8>> {
        let item = CacheItem::new(key, value.to_vec(), Some(self.ttl));
        Ok(serde_json::to_vec(&item)?)
    }
}

fn is_retriable(err: &CacheError) -> bool {
    let CacheError::Backend(source) = err else {
        return false;
    };
    source.downcast_ref::<redis::RedisError>().is_some_and(|err| {
        err.is_timeout()
            || matches!(
                err.kind(),
                redis::ErrorKind::TryAgain
                    | redis::ErrorKind::BusyLoadingError
                    | redis::ErrorKind::MasterDown
            )
    })
}

#[async_trait]
impl Storage for RedisStorage {
    fn time_to_live(&self) -> Option<Duration> {
        Some(self.ttl)
    }

    async fn get(&self, _ctx: &CancellationToken, key: &str) -> Option<CacheItem> {
        let mut conn = self.conn.clone();

        let bytes: Option<Vec<u8>> = match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("redis get for {} failed: {}", key, err);
                return None;
            }
        };

        serde_json::from_slice(&bytes?).ok()
    }

    async fn batch_get(&self, ctx: &CancellationToken, keys: &[String]) -> Vec<CacheItem> {
        let mut queue = dedupe_keys(keys);
        let mut results = Vec::new();

        while !queue.is_empty() {
            if ctx.is_cancelled() {
                return results;
            }

            let take = queue.len().min(MAX_READ_OPS);
            let next: Vec<String> = queue.drain(..take).collect();

            let fetched = with_retry(ctx, is_retriable, || {
                let mut conn = self.conn.clone();
                let next = next.clone();
                async move {
                    let mut cmd = redis::cmd("MGET");
                    for key in &next {
                        cmd.arg(key);
                    }
                    cmd.query_async::<_, Vec<Option<Vec<u8>>>>(&mut conn)
                        .await
                        .map_err(CacheError::backend)
                }
            })
            .await;

            let values = match fetched {
                Ok(values) => values,
                Err(err) => {
                    debug!("redis batch get of {} keys failed: {}", next.len(), err);
                    return results;
                }
            };

            for bytes in values.into_iter().flatten() {
                match serde_json::from_slice::<CacheItem>(&bytes) {
                    Ok(item) => results.push(item),
                    Err(err) => debug!("redis envelope decode failed: {}", err),
                }
            }
        }

        results
    }

    async fn set(&self, _ctx: &CancellationToken, key: &str, value: &[u8]) -> CacheResult<()> {
        let item = self.envelope(key, value)?;
        let mut conn = self.conn.clone();

        redis::cmd("SET")
            .arg(key)
            .arg(item)
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(CacheError::backend)
    }

    async fn batch_set(
        &self,
        ctx: &CancellationToken,
        pairs: &[(String, Vec<u8>)],
    ) -> CacheResult<()> {
        let mut queue: Vec<(String, Vec<u8>)> = Vec::with_capacity(pairs.len());
        let mut seen = HashSet::new();
        // Last occurrence of a key wins, matching single-key overwrites.
        for (key, value) in pairs.iter().rev() {
            if seen.insert(key.as_str()) {
                queue.push((key.clone(), self.envelope(key, value)?));
            }
        }

        let ttl_ms = self.ttl.as_millis() as u64;
        while !queue.is_empty() {
            if ctx.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let take = queue.len().min(MAX_WRITE_OPS);
            let next: Vec<(String, Vec<u8>)> = queue.drain(..take).collect();

            // MSET has no per-key expiry, so pipeline individual SETs into
            // one round-trip.
            with_retry(ctx, is_retriable, || {
                let mut conn = self.conn.clone();
                let next = next.clone();
                async move {
                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    for (key, item) in &next {
                        pipe.cmd("SET").arg(key).arg(item).arg("PX").arg(ttl_ms).ignore();
                    }
                    pipe.query_async::<_, ()>(&mut conn)
                        .await
                        .map_err(CacheError::backend)
                }
            })
            .await?;
        }

        Ok(())
    }

    async fn del(&self, ctx: &CancellationToken, key: &str) -> CacheResult<()> {
        self.batch_del(ctx, &[key.to_string()]).await
    }
}
