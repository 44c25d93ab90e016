//! Waterfall cache: one key/value API over an ordered stack of storage tiers.
//!
//! A [`Cache`] fronts any number of heterogeneous tiers, fastest first.
//! Reads probe the stack top-down, stop at the first hit, and back-fill the
//! tiers that missed with the exact bytes found lower down, so the next read
//! is served higher up. Writes and deletes fan out to every tier in order.
//! Each tier stamps entries with its own time-to-live.
//!
//! Tiers are built lazily: the factories handed to [`Cache::new`] run once,
//! in order, in a background task the first operation awaits.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cascade_cache::adapters::{LruStorage, MemoryStorage};
//! use cascade_cache::Cache;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Cache::new(vec![
//!         LruStorage::maker(10_000, Duration::from_secs(60)),
//!         MemoryStorage::maker(Some(Duration::from_secs(300))),
//!     ])?;
//!
//!     cache.set("user:42", "alice").await?;
//!
//!     let item = cache.get("user:42").await?;
//!     let name: String = serde_json::from_slice(&item.value)?;
//!     assert_eq!(name, "alice");
//!
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cache;
pub mod deferred;
pub mod error;
pub mod retry;
pub mod storage;

pub use cache::{Cache, FinishOp, OpToken, StartOp};
pub use error::{CacheError, CacheResult};
pub use storage::{CacheItem, Storage, StorageFuture, StorageMaker, NO_EXPIRY};
