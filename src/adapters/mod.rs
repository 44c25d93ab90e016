//! Tier adapters conforming to the storage contract.
//!
//! Each adapter encapsulates its own TTL, batching limits, and retry
//! behavior; the coordinator treats them all alike.

pub mod document;
pub mod lru;
pub mod memory;
pub mod redis;
pub mod segmented;

pub use self::document::{
    BatchReadOutcome, BatchWriteOutcome, DocumentClient, DocumentError, DocumentStorage, TableSpec,
};
pub use self::lru::LruStorage;
pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;
pub use self::segmented::SegmentedStorage;
