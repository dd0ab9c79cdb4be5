//! Cache Entry Module
//!
//! Defines the record stored for every key, with its expiration metadata and
//! the links the recency list and the expiry heap keep inside it.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::arena::EntryId;
use crate::cache::item::{CacheItemPriority, RemovedCallback, UpdateCallback};
use crate::clock::add_duration;
use crate::dependency::CacheDependency;

// == Recency Links ==
/// Position of an entry in the recency list.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RecencyLinks {
    pub prev: Option<EntryId>,
    pub next: Option<EntryId>,
    pub linked: bool,
}

// == Cache Entry ==
/// A single cache entry with value and metadata.
pub(crate) struct CacheEntry<V> {
    /// Key the entry is stored under
    pub key: String,
    /// The stored value, None once the entry is a tombstone
    pub value: Option<V>,
    pub dependency: Option<CacheDependency>,
    /// Concrete deadline, None = no expiration
    pub absolute_expiration: Option<DateTime<Utc>>,
    /// Renewal interval applied on every read
    pub sliding_expiration: Option<Duration>,
    pub priority: CacheItemPriority,
    pub on_remove: Option<RemovedCallback<V>>,
    pub on_update: Option<UpdateCallback<V>>,
    /// Last insert or overwrite of this key
    pub last_change: DateTime<Utc>,
    /// Slot in the expiry heap
    pub heap_index: Option<usize>,
    /// Set on removal; a disabled entry is a tombstone
    pub disabled: bool,
    /// Set while its update callback runs outside the store lock
    pub refreshing: bool,
    pub links: RecencyLinks,
}

impl<V> CacheEntry<V> {
    // == Constructor ==
    /// Creates a live entry that never expires.
    pub fn new(key: String, value: V, priority: CacheItemPriority, now: DateTime<Utc>) -> Self {
        Self {
            key,
            value: Some(value),
            dependency: None,
            absolute_expiration: None,
            sliding_expiration: None,
            priority,
            on_remove: None,
            on_update: None,
            last_change: now,
            heap_index: None,
            disabled: false,
            refreshing: false,
            links: RecencyLinks::default(),
        }
    }

    // == Is Expired ==
    /// Checks if the entry's deadline has passed.
    ///
    /// Boundary condition: an entry is expired once `now` reaches the deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.absolute_expiration {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    // == Renew ==
    /// Pushes a sliding deadline out to `now + sliding`.
    ///
    /// Returns the new deadline, or None for entries without sliding expiration.
    pub fn renew_sliding(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let sliding = self.sliding_expiration?;
        let deadline = add_duration(now, sliding);
        self.absolute_expiration = Some(deadline);
        Some(deadline)
    }

    pub fn is_removable(&self) -> bool {
        self.priority.is_removable()
    }
}
