//! Error surface of the waterfall cache.
//!
//! Tier misses are data, not errors: they only become [`CacheError::NotFulfilled`]
//! once every tier in the stack has missed. Backend failures from remote tiers
//! stay opaque to callers and travel inside [`CacheError::Backend`].

use thiserror::Error;

use crate::storage::CacheItem;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Every tier missed; there is no value to return.
    #[error("look up not fulfilled")]
    NotFulfilled,

    /// A batch read resolved some, but not all, of the requested keys. The
    /// resolved envelopes ride along so callers can still use them.
    #[error("look up only partially fulfilled ({} keys resolved)", items.len())]
    PartiallyFulfilled { items: Vec<CacheItem> },

    /// A tier factory failed. Sticky: every operation on the coordinator
    /// surfaces this once initialization has failed.
    #[error("waterfall cache failed to initialize: {0}")]
    Initialization(String),

    /// A tier was constructed with illegal parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The caller's context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Unretryable failure from a remote tier, surfaced by the retry helper.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),

    /// A batch read was requested with zero keys.
    #[error("at least one key is required")]
    EmptyRequest,

    /// The caller-supplied value could not be serialized to the byte envelope.
    #[error("value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Wrap a backend client error without exposing its concrete type.
    pub(crate) fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::Backend(anyhow::Error::new(err))
    }
}
