//! Cache Module
//!
//! Provides the in-process object cache with absolute and sliding expiration,
//! LRU eviction between water marks, and dependency invalidation.

mod arena;
mod entry;
mod enumerator;
mod heap;
mod item;
mod lru;
mod stats;
mod store;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use enumerator::CacheEnumerator;
pub use item::{
    CacheItemOptions, CacheItemPriority, CacheItemRemovedReason, CacheItemUpdate,
    CacheItemUpdateReason, RemovedCallback, UpdateCallback, MAX_SLIDING_EXPIRATION,
};
pub use stats::CacheStats;
pub use store::CacheStore;
