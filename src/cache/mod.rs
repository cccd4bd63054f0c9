//! Partitioned response cache with per-partition strategies.
//!
//! This module provides:
//! - Durable, generation-named partitions with FIFO size bounds
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - An offline fallback when both network and cache come up empty

mod layer;
mod policy;
mod served;
mod storage;

pub use layer::{CacheLayer, OfflineFallback};
pub use policy::PartitionPolicy;
pub use served::{Served, Source};
pub use storage::{CacheStorage, CachedEntry, SqliteStorage, SyncStore};
