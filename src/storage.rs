//! Storage contract shared by every tier.
//!
//! A tier is anything that can hold [`CacheItem`] envelopes: a process-local
//! map, a bounded LRU, a remote key/value or document store. The coordinator
//! only ever talks to tiers through the [`Storage`] trait and never interprets
//! the value bytes it moves between them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CacheResult;

/// Sentinel `expires_at` for entries that never expire.
pub const NO_EXPIRY: i64 = -1;

/// The envelope stored at every tier.
///
/// `value` holds opaque, already-serialized bytes supplied by the coordinator;
/// tiers must not interpret them. At rest the envelope serializes to
/// `{"key": string, "value": base64, "expiresAt": int64}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheItem {
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

impl CacheItem {
    /// Build an envelope for `key`, stamping `expires_at` from the tier TTL.
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at: expires_at_from(ttl),
        }
    }

    /// Whether the entry is stale at the given UTC epoch second.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at != NO_EXPIRY && now > self.expires_at
    }

    /// Whether the entry is stale right now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }
}

/// Absolute expiry for a TTL starting now; `None` maps to [`NO_EXPIRY`].
///
/// Sub-second TTLs round up so an entry never expires before its TTL elapses.
pub fn expires_at_from(ttl: Option<Duration>) -> i64 {
    match ttl {
        Some(ttl) => {
            let mut secs = ttl.as_secs() as i64;
            if ttl.subsec_nanos() > 0 {
                secs += 1;
            }
            chrono::Utc::now().timestamp() + secs
        }
        None => NO_EXPIRY,
    }
}

/// Drop duplicate keys, keeping first occurrences in order.
pub(crate) fn dedupe_keys(keys: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|key| seen.insert(key.as_str()))
        .cloned()
        .collect()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Contract every tier adapter implements.
///
/// All operations are safe under concurrent invocation. Reads never fail
/// loudly: transient lookup errors map to a miss.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The tier's configured TTL; `None` for tiers whose entries never expire.
    fn time_to_live(&self) -> Option<Duration>;

    /// Fetch the envelope if present and non-expired. Expired entries
    /// encountered on read are deleted opportunistically.
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Option<CacheItem>;

    /// Fetch the subset of `keys` that hit. Result order is unspecified and
    /// duplicate input keys yield at most one envelope. Chunking oversized
    /// requests is the adapter's responsibility.
    async fn batch_get(&self, ctx: &CancellationToken, keys: &[String]) -> Vec<CacheItem>;

    /// Store opaque bytes under `key`, stamping the tier's own TTL.
    /// Overwrites any existing entry.
    async fn set(&self, ctx: &CancellationToken, key: &str, value: &[u8]) -> CacheResult<()>;

    /// Store every pair. Not atomic: partial progress before an error is
    /// permitted.
    async fn batch_set(
        &self,
        ctx: &CancellationToken,
        pairs: &[(String, Vec<u8>)],
    ) -> CacheResult<()>;

    /// Remove `key`. Idempotent: deleting an absent key succeeds.
    async fn del(&self, ctx: &CancellationToken, key: &str) -> CacheResult<()>;
}

/// Future returned by a tier factory.
pub type StorageFuture = Pin<Box<dyn Future<Output = CacheResult<Arc<dyn Storage>>> + Send>>;

/// One-shot tier factory. Factories run at most once, in the order supplied,
/// and factory *n+1* only runs after factory *n* succeeded.
pub type StorageMaker = Box<dyn FnOnce() -> StorageFuture + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_json_shape() {
        let item = CacheItem {
            key: "k1".to_string(),
            value: b"payload".to_vec(),
            expires_at: 1_700_000_000,
        };

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["key"], "k1");
        assert_eq!(json["expiresAt"], 1_700_000_000_i64);
        // Value bytes travel base64-encoded.
        assert_eq!(json["value"], "cGF5bG9hZA==");

        let back: CacheItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_no_expiry_sentinel_never_expires() {
        let item = CacheItem::new("k", b"v".to_vec(), None);
        assert_eq!(item.expires_at, NO_EXPIRY);
        assert!(!item.is_expired_at(i64::MAX));
    }

    #[test]
    fn test_subsecond_ttl_rounds_up() {
        let now = chrono::Utc::now().timestamp();
        let stamped = expires_at_from(Some(Duration::from_millis(10)));
        assert!(stamped > now);
    }

    #[test]
    fn test_dedupe_keys_keeps_first_occurrence() {
        let keys = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(dedupe_keys(&keys), vec!["a".to_string(), "b".to_string()]);
    }
}
