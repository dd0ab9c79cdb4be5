//! Cache Statistics Module
//!
//! Tracks cache activity: lookups, inserts and why entries left the cache.

use serde::Serialize;

use crate::cache::item::CacheItemRemovedReason;

// == Cache Stats ==
/// Tracks cache activity counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found, expired or invalidated)
    pub misses: u64,
    pub inserts: u64,
    /// Entries removed explicitly or overwritten
    pub removals: u64,
    pub expirations: u64,
    /// Entries evicted to get back under the low-water mark
    pub evictions: u64,
    pub dependency_changes: u64,
    /// Stale entries replaced by their update callback
    pub refreshes: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_insert(&mut self) {
        self.inserts += 1;
    }

    pub fn record_refresh(&mut self) {
        self.refreshes += 1;
    }

    // == Record Removal ==
    /// Counts a removal under the counter for its reason.
    pub fn record_removal(&mut self, reason: CacheItemRemovedReason) {
        match reason {
            CacheItemRemovedReason::Removed => self.removals += 1,
            CacheItemRemovedReason::Expired => self.expirations += 1,
            CacheItemRemovedReason::Underused => self.evictions += 1,
            CacheItemRemovedReason::DependencyChanged => self.dependency_changes += 1,
        }
    }

    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}
