//! Cache Item Module
//!
//! Value containers describing how an item is stored: priority, expiration,
//! callbacks, and the reasons reported when it leaves the cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dependency::CacheDependency;
use crate::error::{CacheError, Result};

/// Longest sliding expiration accepted (365 days).
pub const MAX_SLIDING_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// == Priority ==
/// Relative cost of an item, consulted when the cache evicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheItemPriority {
    Low,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    /// Never evicted to make room; still removed explicitly, on expiry or on
    /// dependency change.
    NotRemovable,
}

impl CacheItemPriority {
    /// Whether the item may be evicted when the cache is over its high-water mark.
    pub fn is_removable(self) -> bool {
        self != CacheItemPriority::NotRemovable
    }
}

// == Reasons ==
/// Why an item left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheItemRemovedReason {
    /// Explicit `remove` or overwrite by `insert`
    Removed,
    /// Absolute or sliding deadline passed
    Expired,
    /// Evicted to bring the cache under its high-water mark
    Underused,
    /// Dependency reported a change
    DependencyChanged,
}

/// Why the cache is asking an update callback for fresh data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheItemUpdateReason {
    Expired,
    DependencyChanged,
}

impl From<CacheItemUpdateReason> for CacheItemRemovedReason {
    fn from(reason: CacheItemUpdateReason) -> Self {
        match reason {
            CacheItemUpdateReason::Expired => CacheItemRemovedReason::Expired,
            CacheItemUpdateReason::DependencyChanged => CacheItemRemovedReason::DependencyChanged,
        }
    }
}

// == Callbacks ==
/// Invoked with `(key, value, reason)` after an item is removed.
pub type RemovedCallback<V> = Arc<dyn Fn(&str, &V, CacheItemRemovedReason) + Send + Sync>;

/// Invoked with `(key, reason)` before an item would be removed; returning
/// `Ok(Some(update))` keeps the key alive with fresh data.
pub type UpdateCallback<V> =
    Arc<dyn Fn(&str, CacheItemUpdateReason) -> anyhow::Result<Option<CacheItemUpdate<V>>> + Send + Sync>;

// == Update ==
/// Replacement data returned by an update callback.
pub struct CacheItemUpdate<V> {
    pub value: V,
    pub dependency: Option<CacheDependency>,
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_expiration: Option<Duration>,
}

impl<V> CacheItemUpdate<V> {
    /// Replacement that never expires and has no dependency.
    pub fn new(value: V) -> Self {
        Self {
            value,
            dependency: None,
            absolute_expiration: None,
            sliding_expiration: None,
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: CacheDependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    #[must_use]
    pub fn with_absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    #[must_use]
    pub fn with_sliding_expiration(mut self, after: Duration) -> Self {
        self.sliding_expiration = Some(after);
        self
    }
}

impl<V> fmt::Debug for CacheItemUpdate<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItemUpdate")
            .field("dependency", &self.dependency)
            .field("absolute_expiration", &self.absolute_expiration)
            .field("sliding_expiration", &self.sliding_expiration)
            .finish_non_exhaustive()
    }
}

// == Options ==
/// Everything about an insert besides the key and value.
///
/// ```ignore
/// let options = CacheItemOptions::new()
///     .sliding_expiration(Duration::from_secs(20 * 60))
///     .priority(CacheItemPriority::High);
/// store.insert_with("report", report, options)?;
/// ```
pub struct CacheItemOptions<V> {
    pub dependency: Option<CacheDependency>,
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_expiration: Option<Duration>,
    pub priority: CacheItemPriority,
    pub on_remove: Option<RemovedCallback<V>>,
    pub on_update: Option<UpdateCallback<V>>,
}

impl<V> CacheItemOptions<V> {
    /// No dependency, no expiration, normal priority, no callbacks.
    pub fn new() -> Self {
        Self {
            dependency: None,
            absolute_expiration: None,
            sliding_expiration: None,
            priority: CacheItemPriority::Normal,
            on_remove: None,
            on_update: None,
        }
    }

    #[must_use]
    pub fn dependency(mut self, dependency: impl Into<CacheDependency>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    #[must_use]
    pub fn absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    #[must_use]
    pub fn sliding_expiration(mut self, after: Duration) -> Self {
        self.sliding_expiration = Some(after);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: CacheItemPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn on_remove<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &V, CacheItemRemovedReason) + Send + Sync + 'static,
    {
        self.on_remove = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, CacheItemUpdateReason) -> anyhow::Result<Option<CacheItemUpdate<V>>>
            + Send
            + Sync
            + 'static,
    {
        self.on_update = Some(Arc::new(callback));
        self
    }

    /// Rejects out-of-range sliding expirations and conflicting expiration kinds.
    pub(crate) fn validate(&self) -> Result<()> {
        validate_expiration(self.absolute_expiration, self.sliding_expiration)
    }
}

impl<V> Default for CacheItemOptions<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for CacheItemOptions<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheItemOptions")
            .field("dependency", &self.dependency)
            .field("absolute_expiration", &self.absolute_expiration)
            .field("sliding_expiration", &self.sliding_expiration)
            .field("priority", &self.priority)
            .field("on_remove", &self.on_remove.is_some())
            .field("on_update", &self.on_update.is_some())
            .finish()
    }
}

/// A zero sliding expiration means "no sliding expiration".
pub(crate) fn normalize_sliding(sliding: Option<Duration>) -> Option<Duration> {
    sliding.filter(|s| !s.is_zero())
}

pub(crate) fn validate_expiration(
    absolute: Option<DateTime<Utc>>,
    sliding: Option<Duration>,
) -> Result<()> {
    if let Some(sliding) = sliding {
        if sliding > MAX_SLIDING_EXPIRATION {
            return Err(CacheError::SlidingExpirationOutOfRange(sliding));
        }
    }
    if absolute.is_some() && normalize_sliding(sliding).is_some() {
        return Err(CacheError::ConflictingExpiration);
    }
    Ok(())
}
