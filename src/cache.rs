//! The waterfall cache coordinator.
//!
//! One logical key/value cache fronting an ordered stack of heterogeneous
//! tiers. Reads walk the stack fastest-first and back-fill the tiers that
//! missed with the exact bytes found lower down; writes and deletes fan out
//! to every tier in order. Tiers are materialized lazily, once, by a
//! background task the first operation awaits.

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::deferred::Deferred;
use crate::error::{CacheError, CacheResult};
use crate::storage::{dedupe_keys, CacheItem, Storage, StorageMaker};

/// Opaque token handed from `start_op` to the matching `finish_op`.
pub type OpToken = Option<Box<dyn Any + Send>>;

/// Hook invoked at the start of every coordinator operation. The operation
/// name is one of `"Get"`, `"BatchGet"`, `"Set"`, `"BatchSet"`, `"Del"`.
pub type StartOp = Arc<dyn Fn(&CancellationToken, &'static str) -> OpToken + Send + Sync>;

/// Hook invoked on every exit path with the token its `start_op` produced.
pub type FinishOp = Arc<dyn Fn(OpToken) + Send + Sync>;

type Storages = Arc<Vec<Arc<dyn Storage>>>;

/// Tiered waterfall cache.
///
/// The tier sequence is fixed for the coordinator's lifetime and walked
/// top-down: put the fastest tier first. Cross-tier atomicity is not
/// provided; during a fan-out write concurrent readers may observe the old
/// value in lower tiers and the new value in higher ones.
pub struct Cache {
    storages: Deferred<Storages>,
    start_op: StartOp,
    finish_op: FinishOp,
}

impl Cache {
    /// Build a coordinator over the given tier factories with no-op hooks.
    ///
    /// Factories run in order in a background task; the first failure aborts
    /// initialization and every subsequent operation surfaces it. At least
    /// one factory is required.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(makers: Vec<StorageMaker>) -> CacheResult<Self> {
        Self::with_hooks(Arc::new(|_, _| None), Arc::new(|_| {}), makers)
    }

    /// Same as [`Cache::new`], with a `start_op`/`finish_op` pair framing
    /// every operation.
    pub fn with_hooks(
        start_op: StartOp,
        finish_op: FinishOp,
        makers: Vec<StorageMaker>,
    ) -> CacheResult<Self> {
        if makers.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "at least one storage maker is required".into(),
            ));
        }

        Ok(Self {
            storages: Deferred::spawn(initialize_storages(makers)),
            start_op,
            finish_op,
        })
    }

    /// Await initialization and expose the tier list. Primarily for
    /// diagnostics and tests.
    pub async fn storages(&self) -> CacheResult<Vec<Arc<dyn Storage>>> {
        self.storages_with_context(&CancellationToken::new()).await
    }

    pub async fn storages_with_context(
        &self,
        ctx: &CancellationToken,
    ) -> CacheResult<Vec<Arc<dyn Storage>>> {
        Ok(self.tiers(ctx).await?.as_ref().clone())
    }

    async fn tiers(&self, ctx: &CancellationToken) -> CacheResult<Storages> {
        self.storages.wait(ctx).await.map_err(|err| match &*err {
            CacheError::Cancelled => CacheError::Cancelled,
            CacheError::Initialization(msg) => CacheError::Initialization(msg.clone()),
            other => CacheError::Initialization(other.to_string()),
        })
    }

    /// Waterfall read: probe tiers top-down, stop at the first hit and prime
    /// the tiers that missed before returning.
    pub async fn get(&self, key: &str) -> CacheResult<CacheItem> {
        self.get_with_context(&CancellationToken::new(), key).await
    }

    pub async fn get_with_context(
        &self,
        ctx: &CancellationToken,
        key: &str,
    ) -> CacheResult<CacheItem> {
        let storages = self.tiers(ctx).await?;

        let token = (self.start_op)(ctx, "Get");
        let result = waterfall_get(ctx, &storages, key).await;
        (self.finish_op)(token);

        result
    }

    /// Waterfall batch read. Resolves as many keys as the stack can serve;
    /// when only a subset resolves the envelopes ride along inside
    /// [`CacheError::PartiallyFulfilled`].
    pub async fn batch_get(&self, keys: &[String]) -> CacheResult<Vec<CacheItem>> {
        self.batch_get_with_context(&CancellationToken::new(), keys)
            .await
    }

    pub async fn batch_get_with_context(
        &self,
        ctx: &CancellationToken,
        keys: &[String],
    ) -> CacheResult<Vec<CacheItem>> {
        let storages = self.tiers(ctx).await?;

        let token = (self.start_op)(ctx, "BatchGet");
        let result = waterfall_batch_get(ctx, &storages, keys).await;
        (self.finish_op)(token);

        result
    }

    /// Fan-out write: serialize `value` once and store the bytes in every
    /// tier in order. The first tier error aborts the fan-out; earlier tiers
    /// remain updated.
    pub async fn set<T>(&self, key: &str, value: &T) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.set_with_context(&CancellationToken::new(), key, value)
            .await
    }

    pub async fn set_with_context<T>(
        &self,
        ctx: &CancellationToken,
        key: &str,
        value: &T,
    ) -> CacheResult<()>
    where
        T: Serialize + ?Sized,
    {
        let storages = self.tiers(ctx).await?;

        let token = (self.start_op)(ctx, "Set");
        let result = fan_out_set(ctx, &storages, key, value).await;
        (self.finish_op)(token);

        result
    }

    /// Fan-out batch write with [`Cache::set`] semantics per pair.
    pub async fn batch_set<T: Serialize>(&self, pairs: &[(String, T)]) -> CacheResult<()> {
        self.batch_set_with_context(&CancellationToken::new(), pairs)
            .await
    }

    pub async fn batch_set_with_context<T: Serialize>(
        &self,
        ctx: &CancellationToken,
        pairs: &[(String, T)],
    ) -> CacheResult<()> {
        let storages = self.tiers(ctx).await?;

        let token = (self.start_op)(ctx, "BatchSet");
        let result = fan_out_batch_set(ctx, &storages, pairs).await;
        (self.finish_op)(token);

        result
    }

    /// Fan-out delete: remove `key` from every tier in order. The first tier
    /// error aborts and surfaces.
    pub async fn del(&self, key: &str) -> CacheResult<()> {
        self.del_with_context(&CancellationToken::new(), key).await
    }

    pub async fn del_with_context(&self, ctx: &CancellationToken, key: &str) -> CacheResult<()> {
        let storages = self.tiers(ctx).await?;

        let token = (self.start_op)(ctx, "Del");
        let result = fan_out_del(ctx, &storages, key).await;
        (self.finish_op)(token);

        result
    }
}

async fn initialize_storages(makers: Vec<StorageMaker>) -> CacheResult<Storages> {
    let mut storages: Vec<Arc<dyn Storage>> = Vec::with_capacity(makers.len());

    for (position, make_storage) in makers.into_iter().enumerate() {
        match make_storage().await {
            Ok(storage) => storages.push(storage),
            Err(err) => {
                warn!("tier factory {} failed: {}", position, err);
                return Err(CacheError::Initialization(err.to_string()));
            }
        }
    }

    debug!("initialized {} storage tiers", storages.len());
    Ok(Arc::new(storages))
}

async fn waterfall_get(
    ctx: &CancellationToken,
    storages: &Storages,
    key: &str,
) -> CacheResult<CacheItem> {
    let mut missed: Vec<&Arc<dyn Storage>> = Vec::new();

    for storage in storages.iter() {
        if ctx.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let Some(item) = storage.get(ctx, key).await else {
            missed.push(storage);
            continue;
        };

        // Prime the tiers above the hit with the exact bytes it returned.
        // Best effort: a failed priming write must not mask the read.
        for storage in missed {
            if ctx.is_cancelled() {
                break;
            }
            if let Err(err) = storage.set(ctx, key, &item.value).await {
                debug!("priming write for {} failed: {}", key, err);
            }
        }

        return Ok(item);
    }

    Err(CacheError::NotFulfilled)
}

async fn waterfall_batch_get(
    ctx: &CancellationToken,
    storages: &Storages,
    keys: &[String],
) -> CacheResult<Vec<CacheItem>> {
    if keys.is_empty() {
        return Err(CacheError::EmptyRequest);
    }

    // Duplicate input keys resolve to at most one envelope.
    let mut missing = dedupe_keys(keys);
    let mut items: Vec<CacheItem> = Vec::new();
    let mut missing_by_tier: Vec<(Arc<dyn Storage>, Vec<String>)> = Vec::new();

    for storage in storages.iter() {
        if ctx.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let hits = storage.batch_get(ctx, &missing).await;
        if !hits.is_empty() {
            let requested: HashSet<&str> = missing.iter().map(String::as_str).collect();
            let mut resolved: HashSet<String> = HashSet::with_capacity(hits.len());

            // Keys we never asked this tier for do not re-enter the walk.
            for hit in hits {
                if requested.contains(hit.key.as_str()) && resolved.insert(hit.key.clone()) {
                    items.push(hit);
                }
            }

            missing.retain(|key| !resolved.contains(key));
        }

        if missing.is_empty() {
            break;
        }

        // Snapshot after this tier's own attempt: it only gets primed with
        // keys that tiers below it end up resolving.
        missing_by_tier.push((Arc::clone(storage), missing.clone()));
    }

    if items.is_empty() {
        return Err(CacheError::NotFulfilled);
    }

    for (storage, wanted) in missing_by_tier {
        if ctx.is_cancelled() {
            break;
        }

        let wanted: HashSet<&str> = wanted.iter().map(String::as_str).collect();
        let pairs: Vec<(String, Vec<u8>)> = items
            .iter()
            .filter(|item| wanted.contains(item.key.as_str()))
            .map(|item| (item.key.clone(), item.value.clone()))
            .collect();

        if pairs.is_empty() {
            continue;
        }
        if let Err(err) = storage.batch_set(ctx, &pairs).await {
            debug!("priming batch write of {} keys failed: {}", pairs.len(), err);
        }
    }

    if !missing.is_empty() {
        return Err(CacheError::PartiallyFulfilled { items });
    }

    Ok(items)
}

async fn fan_out_set<T>(
    ctx: &CancellationToken,
    storages: &Storages,
    key: &str,
    value: &T,
) -> CacheResult<()>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(value)?;

    for storage in storages.iter() {
        if ctx.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        storage.set(ctx, key, &bytes).await?;
    }

    Ok(())
}

async fn fan_out_batch_set<T: Serialize>(
    ctx: &CancellationToken,
    storages: &Storages,
    pairs: &[(String, T)],
) -> CacheResult<()> {
    let mut encoded: Vec<(String, Vec<u8>)> = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        encoded.push((key.clone(), serde_json::to_vec(value)?));
    }

    for storage in storages.iter() {
        if ctx.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        storage.batch_set(ctx, &encoded).await?;
    }

    Ok(())
}

async fn fan_out_del(
    ctx: &CancellationToken,
    storages: &Storages,
    key: &str,
) -> CacheResult<()> {
    for storage in storages.iter() {
        if ctx.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        storage.del(ctx, key).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStorage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_zero_makers_fail_construction() {
        let result = Cache::new(Vec::new());
        assert!(matches!(result, Err(CacheError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_get_is_rejected() {
        let cache = Cache::new(vec![MemoryStorage::maker(Some(Duration::from_secs(300)))]).unwrap();
        let result = cache.batch_get(&[]).await;
        assert!(matches!(result, Err(CacheError::EmptyRequest)));
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits() {
        let cache = Cache::new(vec![MemoryStorage::maker(Some(Duration::from_secs(300)))]).unwrap();
        // Let initialization finish so cancellation is what trips the op.
        cache.storages().await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();

        assert!(matches!(
            cache.get_with_context(&ctx, "k").await,
            Err(CacheError::Cancelled)
        ));
        assert!(matches!(
            cache.set_with_context(&ctx, "k", "v").await,
            Err(CacheError::Cancelled)
        ));
        assert!(matches!(
            cache.del_with_context(&ctx, "k").await,
            Err(CacheError::Cancelled)
        ));
    }
}
