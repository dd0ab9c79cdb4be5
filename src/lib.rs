//! Cache Engine - an in-process object cache
//!
//! Stores keyed values with absolute or sliding expiration, priority-aware
//! LRU eviction, and invalidation through file, cache-key and composite
//! dependencies.

pub mod cache;
pub mod clock;
pub mod config;
pub mod dependency;
pub mod error;
mod tasks;

pub use cache::{
    CacheItemOptions, CacheItemPriority, CacheItemRemovedReason, CacheItemUpdate,
    CacheItemUpdateReason, CacheStats, CacheStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use dependency::{AggregateCacheDependency, CacheDependency, CacheDependencyBuilder};
pub use error::{CacheError, Result};
