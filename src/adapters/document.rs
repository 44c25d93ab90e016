//! Remote document-store tier.
//!
//! The concrete client library is an external collaborator: the tier talks
//! to it through [`DocumentClient`], whose item operations carry the cache
//! envelope in the store's own attribute encoding (`key` string partition
//! key, `value` binary, `expiresAt` number of epoch seconds, registered as
//! the table's native TTL attribute). Production code implements the trait
//! over a real SDK client; tests drive it with an in-memory fake.
//!
//! Providers cap batch sizes and may return part of a batch as unprocessed
//! when a response would be oversized or throughput is exhausted; the tier
//! chunks its queues and keeps requeueing unprocessed keys until they drain.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::retry::{retriable_status, with_retry};
use crate::storage::{dedupe_keys, CacheItem, Storage, StorageMaker};

/// Providers reject batch reads above this many keys per round-trip.
pub const MAX_READ_OPS: usize = 100;
/// Providers reject batch writes above this many items per round-trip.
pub const MAX_WRITE_OPS: usize = 25;

/// Partition key attribute name.
pub const KEY_ATTRIBUTE: &str = "key";
/// Attribute registered as the table's native TTL field.
pub const TTL_ATTRIBUTE: &str = "expiresAt";

/// Error reported by a document-store client.
#[derive(Debug, Error)]
#[error("document store error: {message}")]
pub struct DocumentError {
    /// HTTP status of the failed request, when one was received.
    pub status: Option<u16>,
    /// Provider-flagged throttling or otherwise retryable condition.
    pub throttled: bool,
    pub message: String,
}

impl DocumentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            throttled: false,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            throttled: false,
            message: message.into(),
        }
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self {
            status: None,
            throttled: true,
            message: message.into(),
        }
    }

    fn is_retriable(&self) -> bool {
        self.throttled || self.status.is_some_and(retriable_status)
    }
}

/// Table settings applied when the tier provisions its own table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub read_capacity_units: i64,
    pub write_capacity_units: i64,
}

/// Outcome of one batch-read round-trip: the decoded items plus the keys the
/// provider could not serve this round-trip.
#[derive(Debug, Default)]
pub struct BatchReadOutcome {
    pub items: Vec<CacheItem>,
    pub unprocessed_keys: Vec<String>,
}

/// Outcome of one batch-write round-trip.
#[derive(Debug, Default)]
pub struct BatchWriteOutcome {
    pub unprocessed_keys: Vec<String>,
}

/// Contract a document-store client implements for this tier.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Whether the table exists.
    async fn table_exists(&self, table: &str) -> Result<bool, DocumentError>;

    /// Create the table with [`KEY_ATTRIBUTE`] as its string partition key.
    /// Racing creators may both observe the table as absent; losing that
    /// race must not be fatal to the caller.
    async fn create_table(&self, table: &str, spec: &TableSpec) -> Result<(), DocumentError>;

    /// Register `attribute` as the table's native TTL field.
    async fn register_ttl_attribute(
        &self,
        table: &str,
        attribute: &str,
    ) -> Result<(), DocumentError>;

    async fn get_item(&self, table: &str, key: &str) -> Result<Option<CacheItem>, DocumentError>;

    /// Read up to [`MAX_READ_OPS`] keys. Keys the provider declined to serve
    /// come back in `unprocessed_keys`.
    async fn batch_get_item(
        &self,
        table: &str,
        keys: &[String],
    ) -> Result<BatchReadOutcome, DocumentError>;

    async fn put_item(&self, table: &str, item: CacheItem) -> Result<(), DocumentError>;

    /// Write up to [`MAX_WRITE_OPS`] items. Items the provider declined come
    /// back as `unprocessed_keys`.
    async fn batch_put_item(
        &self,
        table: &str,
        items: Vec<CacheItem>,
    ) -> Result<BatchWriteOutcome, DocumentError>;

    async fn delete_item(&self, table: &str, key: &str) -> Result<(), DocumentError>;
}

pub struct DocumentStorage {
    client: Arc<dyn DocumentClient>,
    table_name: String,
    ttl: Duration,
}

impl DocumentStorage {
    /// Factory that validates its configuration and provisions the table on
    /// first use: when absent it is created with `spec`'s capacity units and
    /// [`TTL_ATTRIBUTE`] registered for native expiry.
    pub fn maker(
        client: Arc<dyn DocumentClient>,
        table_name: impl Into<String>,
        spec: TableSpec,
        ttl: Duration,
    ) -> StorageMaker {
        let table_name = table_name.into();
        Box::new(move || {
            Box::pin(async move {
                if table_name.is_empty() {
                    return Err(CacheError::InvalidConfiguration(
                        "document storage requires a table name".into(),
                    ));
                }
                if ttl.is_zero() {
                    return Err(CacheError::InvalidConfiguration(
                        "document storage requires a non-zero ttl".into(),
                    ));
                }

                let storage = DocumentStorage {
                    client,
                    table_name,
                    ttl,
                };
                storage.prepare_table(&spec).await?;

                Ok(Arc::new(storage) as Arc<dyn Storage>)
            })
        })
    }

    async fn prepare_table(&self, spec: &TableSpec) -> CacheResult<()> {
        let exists = self
            .client
            .table_exists(&self.table_name)
            .await
            .map_err(CacheError::backend)?;
        if exists {
            return Ok(());
        }

        if let Err(err) = self.client.create_table(&self.table_name, spec).await {
            // Another process may have won the creation race.
            let created_elsewhere = self
                .client
                .table_exists(&self.table_name)
                .await
                .unwrap_or(false);
            if !created_elsewhere {
                return Err(CacheError::backend(err));
            }
            debug!("table {} was created concurrently: {}", self.table_name, err);
        }

        self.client
            .register_ttl_attribute(&self.table_name, TTL_ATTRIBUTE)
            .await
            .map_err(CacheError::backend)?;

        Ok(())
    }
}

fn is_retriable(err: &CacheError) -> bool {
    let CacheError::Backend(source) = err else {
        return false;
    };
    source
        .downcast_ref::<DocumentError>()
        .is_some_and(|err| err.is_retriable())
}

#[async_trait]
impl Storage for DocumentStorage {
    fn time_to_live(&self) -> Option<Duration> {
        Some(self.ttl)
    }

    async fn get(&self, _ctx: &CancellationToken, key: &str) -> Option<CacheItem> {
        match self.client.get_item(&self.table_name, key).await {
            // Native TTL deletion is lazy; an expired item may still be
            // served and must read as a miss.
            Ok(item) => item.filter(|item| !item.is_expired()),
            Err(err) => {
                debug!("document get for {} failed: {}", key, err);
                None
            }
        }
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

            let outcome = with_retry(ctx, is_retriable, || {
                let client = Arc::clone(&self.client);
                let table = self.table_name.clone();
                let next = next.clone();
                async move {
                    client
                        .batch_get_item(&table, &next)
                        .await
                        .map_err(CacheError::backend)
                }
            })
            .await;

            match outcome {
                Ok(outcome) => {
                    results.extend(outcome.items.into_iter().filter(|item| !item.is_expired()));
                    queue.extend(outcome.unprocessed_keys);
                }
                Err(err) => {
                    debug!("document batch get of {} keys failed: {}", next.len(), err);
                    return results;
                }
            }
        }

        results
    }

    async fn set(&self, _ctx: &CancellationToken, key: &str, value: &[u8]) -> CacheResult<()> {
        let item = CacheItem::new(key, value.to_vec(), Some(self.ttl));
        self.client
            .put_item(&self.table_name, item)
            .await
            .map_err(CacheError::backend)
    }

    async fn batch_set(
        &self,
        ctx: &CancellationToken,
        pairs: &[(String, Vec<u8>)],
    ) -> CacheResult<()> {
        // Providers reject a batch holding the same key twice; last wins.
        let mut queue: Vec<(String, Vec<u8>)> = Vec::with_capacity(pairs.len());
        let mut seen = HashSet::new();
        for (key, value) in pairs.iter().rev() {
            if seen.insert(key.as_str()) {
                queue.push((key.clone(), value.clone()));
            }
        }

        while !queue.is_empty() {
            if ctx.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let take = queue.len().min(MAX_WRITE_OPS);
            let next: Vec<(String, Vec<u8>)> = queue.drain(..take).collect();

            let items: Vec<CacheItem> = next
                .iter()
                .map(|(key, value)| CacheItem::new(key.clone(), value.clone(), Some(self.ttl)))
                .collect();

            let outcome = with_retry(ctx, is_retriable, || {
                let client = Arc::clone(&self.client);
                let table = self.table_name.clone();
                let items = items.clone();
                async move {
                    client
                        .batch_put_item(&table, items)
                        .await
                        .map_err(CacheError::backend)
                }
            })
            .await?;

            if !outcome.unprocessed_keys.is_empty() {
                // Throughput limits: hand the leftovers to a later round-trip
                // with their original bytes.
                let unprocessed: HashSet<String> =
                    outcome.unprocessed_keys.into_iter().collect();
                queue.extend(
                    next.into_iter()
                        .filter(|(key, _)| unprocessed.contains(key)),
                );
            }
        }

        Ok(())
    }

    async fn del(&self, _ctx: &CancellationToken, key: &str) -> CacheResult<()> {
        self.client
            .delete_item(&self.table_name, key)
            .await
            .map_err(CacheError::backend)
    }
}
