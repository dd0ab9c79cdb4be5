//! Cache Store Module
//!
//! Main cache engine combining the recency index, the expiry heap and the
//! dependency protocol under one lock.
//!
//! Public methods take the lock; the `*_locked` helpers assume it is held.
//! Removal side effects (dependency disposal, removal callbacks) are queued
//! while locked and run after the lock is released. Update callbacks also run
//! unlocked, and their result is applied only if the entry is still current.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use tracing::{debug, info, warn};

use crate::cache::arena::{EntryArena, EntryId};
use crate::cache::entry::CacheEntry;
use crate::cache::enumerator::CacheEnumerator;
use crate::cache::heap::ExpiryHeap;
use crate::cache::item::{
    normalize_sliding, validate_expiration, CacheItemOptions, CacheItemRemovedReason,
    CacheItemUpdate, CacheItemUpdateReason, RemovedCallback, UpdateCallback,
};
use crate::cache::lru::RecencyIndex;
use crate::cache::stats::CacheStats;
use crate::clock::{add_duration, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::dependency::{
    AggregateCacheDependency, CacheDependency, CacheDependencyBuilder, DependencyHost, KeyLookup,
};
use crate::error::{CacheError, Result};
use crate::tasks::{ExpirationTimer, ExpirySweeper};

// == Cache State ==
/// Everything guarded by the store lock.
pub(crate) struct CacheState<V> {
    arena: EntryArena<V>,
    index: RecencyIndex,
    heap: ExpiryHeap,
}

impl<V> CacheState<V> {
    fn new(config: &CacheConfig) -> Self {
        Self {
            arena: EntryArena::new(),
            index: RecencyIndex::new(config.high_water_mark, config.low_water_mark),
            heap: ExpiryHeap::new(),
        }
    }
}

impl<V> KeyLookup for CacheState<V> {
    fn last_change(&self, key: &str) -> Option<DateTime<Utc>> {
        self.index.peek(key).map(|id| self.arena[id].last_change)
    }
}

// == Removal ==
/// Side effects of a removal, run once the lock is released.
struct Removal<V> {
    key: String,
    value: Option<V>,
    reason: CacheItemRemovedReason,
    dependency: Option<CacheDependency>,
    on_remove: Option<RemovedCallback<V>>,
}

impl<V> Removal<V> {
    fn complete(self) {
        if let Some(dependency) = &self.dependency {
            dependency.dispose();
        }
        if let (Some(callback), Some(value)) = (&self.on_remove, &self.value) {
            invoke_removed(callback, &self.key, value, self.reason);
        }
    }
}

fn invoke_removed<V>(callback: &RemovedCallback<V>, key: &str, value: &V, reason: CacheItemRemovedReason) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| callback(key, value, reason)));
    if result.is_err() {
        warn!(key, ?reason, "Removal callback panicked");
    }
}

fn invoke_update<V>(
    callback: &UpdateCallback<V>,
    key: &str,
    reason: CacheItemUpdateReason,
) -> Option<CacheItemUpdate<V>> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(key, reason))) {
        Ok(Ok(update)) => update,
        Ok(Err(e)) => {
            warn!(key, ?reason, "Update callback failed: {:#}", e);
            None
        }
        Err(_) => {
            warn!(key, ?reason, "Update callback panicked");
            None
        }
    }
}

// == Refresh ==
/// Stale entry whose update callback has yet to run.
struct PendingRefresh<V> {
    id: EntryId,
    key: String,
    reason: CacheItemUpdateReason,
    callback: UpdateCallback<V>,
}

/// How a refresh ended.
enum RefreshOutcome<V> {
    /// The callback supplied a replacement, holding its value
    Replaced(Option<V>),
    Removed,
    /// The entry was replaced or removed while its callback ran
    Superseded,
}

fn validate_key(key: String) -> Result<String> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey(
            "cache key must not be empty".to_string(),
        ));
    }
    Ok(key)
}

// == Shared Store ==
struct StoreShared<V> {
    state: RwLock<CacheState<V>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    stats: Mutex<CacheStats>,
    /// Created on the first deadline
    timer: Mutex<Option<ExpirationTimer>>,
    self_ref: Weak<StoreShared<V>>,
}

impl<V> StoreShared<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn host_ref(&self) -> Weak<dyn DependencyHost> {
        self.self_ref.clone()
    }

    fn deadline_of(&self, entry: &CacheEntry<V>) -> Option<DateTime<Utc>> {
        if self.config.disable_expiration {
            None
        } else {
            entry.absolute_expiration
        }
    }

    // == Timer ==
    fn arm_timer(&self, deadline: DateTime<Utc>) {
        let mut timer = self.timer.lock();
        if timer.is_none() {
            let sweeper: Weak<dyn ExpirySweeper> = self.self_ref.clone();
            match ExpirationTimer::spawn(sweeper, self.clock.clone()) {
                Ok(spawned) => *timer = Some(spawned),
                Err(e) => {
                    warn!("Failed to start expiration timer: {}", e);
                    return;
                }
            }
        }
        if let Some(timer) = timer.as_ref() {
            timer.arm_if_earlier(deadline);
        }
    }

    // == Staleness ==
    /// Why the entry can no longer be served as is, if it cannot.
    fn staleness(&self, state: &CacheState<V>, id: EntryId, now: DateTime<Utc>) -> Option<CacheItemUpdateReason> {
        let entry = &state.arena[id];
        if entry
            .dependency
            .as_ref()
            .is_some_and(|dependency| dependency.has_changed_in(state))
        {
            return Some(CacheItemUpdateReason::DependencyChanged);
        }
        if !self.config.disable_expiration && entry.is_expired(now) {
            return Some(CacheItemUpdateReason::Expired);
        }
        None
    }

    // == Store Entry ==
    /// Writes a new entry under `key`, tearing down the one it replaces.
    ///
    /// The dependency in `options` must already be attached.
    fn store_entry_locked(
        &self,
        state: &mut CacheState<V>,
        key: String,
        value: V,
        options: CacheItemOptions<V>,
        now: DateTime<Utc>,
        out: &mut Vec<Removal<V>>,
    ) -> EntryId {
        let CacheItemOptions {
            dependency,
            absolute_expiration,
            sliding_expiration,
            priority,
            on_remove,
            on_update,
        } = options;
        let sliding = normalize_sliding(sliding_expiration);

        let mut entry = CacheEntry::new(key.clone(), value, priority, now);
        entry.dependency = dependency;
        entry.sliding_expiration = sliding;
        entry.absolute_expiration = match sliding {
            Some(sliding) => Some(add_duration(now, sliding)),
            None => absolute_expiration,
        };
        entry.on_remove = on_remove;
        entry.on_update = on_update;
        let deadline = self.deadline_of(&entry);

        let id = state.arena.insert(entry);
        if let Some(replaced) = state.index.set(&mut state.arena, key, id) {
            self.retire_locked(state, replaced, CacheItemRemovedReason::Removed, true, out);
        }
        if let Some(deadline) = deadline {
            state.heap.enqueue(&mut state.arena, id, deadline);
            self.arm_timer(deadline);
        }
        id
    }

    // == Remove ==
    fn remove_locked(
        &self,
        state: &mut CacheState<V>,
        key: &str,
        reason: CacheItemRemovedReason,
        out: &mut Vec<Removal<V>>,
    ) -> Option<V> {
        let id = state.index.remove(&mut state.arena, key)?;
        let value = state.arena[id].value.clone();
        self.retire_locked(state, id, reason, true, out);
        value
    }

    /// Tombstones an entry that is no longer in the index and frees its slot,
    /// dropping its heap node if it still has one.
    fn retire_locked(
        &self,
        state: &mut CacheState<V>,
        id: EntryId,
        reason: CacheItemRemovedReason,
        notify: bool,
        out: &mut Vec<Removal<V>>,
    ) {
        let Some(entry) = state.arena.get_mut(id) else {
            return;
        };
        entry.disabled = true;
        let queued = entry.heap_index.is_some();
        let removal = Removal {
            key: std::mem::take(&mut entry.key),
            value: entry.value.take(),
            reason,
            dependency: entry.dependency.take(),
            on_remove: entry.on_remove.take().filter(|_| notify),
        };
        entry.on_update = None;
        if queued {
            state.heap.remove(&mut state.arena, id);
        }
        state.arena.release(id);

        if notify {
            self.stats.lock().record_removal(reason);
        }
        debug!(key = %removal.key, ?reason, "Removed cache entry");
        out.push(removal);
    }

    // == Update Path ==
    /// Handles an entry that can no longer be served as is.
    ///
    /// An entry with an update callback is marked as refreshing and handed
    /// back, since the callback may only run once the lock is released. Any
    /// other entry is removed right away.
    fn expire_locked(
        &self,
        state: &mut CacheState<V>,
        id: EntryId,
        reason: CacheItemUpdateReason,
        out: &mut Vec<Removal<V>>,
    ) -> Option<PendingRefresh<V>> {
        let entry = &mut state.arena[id];
        let key = entry.key.clone();
        if let Some(callback) = entry.on_update.clone() {
            entry.refreshing = true;
            return Some(PendingRefresh {
                id,
                key,
                reason,
                callback,
            });
        }

        state.index.remove(&mut state.arena, &key);
        self.retire_locked(state, id, reason.into(), true, out);
        None
    }

    /// Runs a pending update callback without the lock held, then applies
    /// its result if the entry is still the one stored under its key.
    ///
    /// The callback may use the store freely. While it runs, reads of the
    /// stale key miss and no other path starts a second refresh for it.
    fn refresh(&self, pending: PendingRefresh<V>) -> RefreshOutcome<V> {
        let PendingRefresh {
            id,
            key,
            reason,
            callback,
        } = pending;
        let update = invoke_update(&callback, &key, reason).and_then(|update| {
            match self.prepare_update(&update) {
                Ok(()) => Some(update),
                Err(e) => {
                    warn!(key = %key, "Discarding invalid cache item update: {}", e);
                    None
                }
            }
        });

        let mut removals = Vec::new();
        let mut orphaned = None;
        let outcome = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            if state.index.peek(&key) != Some(id) {
                debug!(key = %key, "Cache entry changed during its update callback");
                orphaned = update.and_then(|update| update.dependency);
                RefreshOutcome::Superseded
            } else {
                state.arena[id].refreshing = false;
                match update {
                    Some(update) => {
                        let now = self.clock.now();
                        let replacement = self.apply_update_locked(state, id, update, now, &mut removals);
                        RefreshOutcome::Replaced(state.arena[replacement].value.clone())
                    }
                    None => {
                        state.index.remove(&mut state.arena, &key);
                        self.retire_locked(state, id, reason.into(), true, &mut removals);
                        RefreshOutcome::Removed
                    }
                }
            }
        };

        if let Some(dependency) = orphaned {
            dependency.dispose();
        }
        self.finish(removals);
        outcome
    }

    /// Checks an update and attaches its dependency to this store.
    fn prepare_update(&self, update: &CacheItemUpdate<V>) -> Result<()> {
        validate_expiration(update.absolute_expiration, update.sliding_expiration)?;
        if let Some(dependency) = &update.dependency {
            dependency.attach(self.host_ref())?;
        }
        Ok(())
    }

    /// Replaces a stale entry with a prepared update.
    fn apply_update_locked(
        &self,
        state: &mut CacheState<V>,
        stale: EntryId,
        update: CacheItemUpdate<V>,
        now: DateTime<Utc>,
        out: &mut Vec<Removal<V>>,
    ) -> EntryId {
        let (key, options) = {
            let entry = &state.arena[stale];
            let options = CacheItemOptions {
                dependency: update.dependency,
                absolute_expiration: update.absolute_expiration,
                sliding_expiration: update.sliding_expiration,
                priority: entry.priority,
                on_remove: entry.on_remove.clone(),
                on_update: entry.on_update.clone(),
            };
            (entry.key.clone(), options)
        };

        // The stale entry goes without its removal callback
        state.index.remove(&mut state.arena, &key);
        self.retire_locked(state, stale, CacheItemRemovedReason::Removed, false, out);
        let replacement = self.store_entry_locked(state, key, update.value, options, now, out);

        self.stats.lock().record_refresh();
        replacement
    }

    // == Sliding Renewal ==
    fn renew_sliding_locked(&self, state: &mut CacheState<V>, id: EntryId, now: DateTime<Utc>) {
        let Some(deadline) = state.arena[id].renew_sliding(now) else {
            return;
        };
        if !state.heap.update(&mut state.arena, id, deadline) {
            state.heap.enqueue(&mut state.arena, id, deadline);
        }
        self.arm_timer(deadline);
    }

    // == Eviction ==
    /// Trims the recency list to the low-water mark once an insert pushed it
    /// to the high-water mark.
    fn evict_if_necessary_locked(&self, state: &mut CacheState<V>, out: &mut Vec<Removal<V>>) {
        if !state.index.take_eviction_flag() {
            return;
        }

        let mut evicted = 0;
        while state.index.above_low_water_mark() {
            let Some(id) = state.index.least_recent() else {
                break;
            };
            let key = state.arena[id].key.clone();
            state.index.remove(&mut state.arena, &key);
            self.retire_locked(state, id, CacheItemRemovedReason::Underused, true, out);
            evicted += 1;
        }
        info!("Evicted {} underused entries", evicted);
    }

    // == Dependencies ==
    fn check_dependencies_locked(
        &self,
        state: &mut CacheState<V>,
        out: &mut Vec<Removal<V>>,
    ) -> Vec<PendingRefresh<V>> {
        let candidates = state
            .index
            .select_where(&state.arena, |entry| entry.dependency.is_some() && !entry.refreshing);

        let mut pending = Vec::new();
        for id in candidates {
            if !state.arena.is_live(id) {
                continue;
            }
            let changed = state.arena[id]
                .dependency
                .clone()
                .is_some_and(|dependency| dependency.has_changed_in(&*state));
            if changed {
                pending.extend(self.expire_locked(state, id, CacheItemUpdateReason::DependencyChanged, out));
            }
        }
        pending
    }

    fn check_dependencies_now(&self) {
        let mut removals = Vec::new();
        let pending = {
            let mut guard = self.state.write();
            self.check_dependencies_locked(&mut guard, &mut removals)
        };
        if !removals.is_empty() {
            debug!("Dependency check removed {} entries", removals.len());
        }
        self.finish(removals);
        for refresh in pending {
            self.refresh(refresh);
        }
    }

    // == Sweep ==
    /// Removes every entry whose deadline has passed, handing back those
    /// with an update callback.
    ///
    /// Due entries are dequeued before any callback runs, so a replacement
    /// that is already due waits for the next sweep.
    fn sweep_locked(
        &self,
        state: &mut CacheState<V>,
        now: DateTime<Utc>,
        out: &mut Vec<Removal<V>>,
        pending: &mut Vec<PendingRefresh<V>>,
    ) -> (usize, Option<DateTime<Utc>>) {
        let mut due = Vec::new();
        while let Some(node) = state.heap.peek() {
            if node.expires_at > now {
                break;
            }
            state.heap.dequeue(&mut state.arena);
            due.push(node.id);
        }

        let mut expired = 0;
        for id in due {
            // A refresh already in flight settles the entry itself
            if !state.arena.is_live(id) || state.arena[id].refreshing {
                continue;
            }
            match self.expire_locked(state, id, CacheItemUpdateReason::Expired, out) {
                Some(refresh) => pending.push(refresh),
                None => expired += 1,
            }
        }
        (expired, state.heap.peek().map(|node| node.expires_at))
    }

    fn sweep_now(&self) -> (usize, Option<DateTime<Utc>>) {
        let mut removals = Vec::new();
        let mut pending = Vec::new();
        let (mut expired, next) = {
            let mut guard = self.state.write();
            let now = self.clock.now();
            self.sweep_locked(&mut guard, now, &mut removals, &mut pending)
        };
        self.finish(removals);
        for refresh in pending {
            if matches!(self.refresh(refresh), RefreshOutcome::Removed) {
                expired += 1;
            }
        }

        if expired > 0 {
            info!("Expiration sweep: removed {} expired entries", expired);
        } else {
            debug!("Expiration sweep: no expired entries found");
        }
        (expired, next)
    }

    fn finish(&self, removals: Vec<Removal<V>>) {
        for removal in removals {
            removal.complete();
        }
    }
}

impl<V> DependencyHost for StoreShared<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn key_last_change(&self, key: &str) -> Option<DateTime<Utc>> {
        self.state.read().last_change(key)
    }

    fn check_dependencies(&self) {
        self.check_dependencies_now();
    }
}

impl<V> ExpirySweeper for StoreShared<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn sweep_expired(&self) -> Option<DateTime<Utc>> {
        self.sweep_now().1
    }
}

// == Cache Store ==
/// Thread-safe in-process object cache.
///
/// Cloning a store clones a handle to the same cache.
///
/// ```ignore
/// let store = CacheStore::new(CacheConfig::default())?;
/// store.insert_with(
///     "report",
///     report,
///     CacheItemOptions::new()
///         .sliding_expiration(Duration::from_secs(600))
///         .on_remove(|key, _, reason| info!("{} left the cache: {:?}", key, reason)),
/// )?;
/// ```
pub struct CacheStore<V> {
    shared: Arc<StoreShared<V>>,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates a store driven by the system clock.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a store whose deadlines and change stamps come from `clock`.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, clock))
    }

    fn from_parts(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            high_water_mark = config.high_water_mark,
            low_water_mark = config.low_water_mark,
            disable_expiration = config.disable_expiration,
            "Creating cache store"
        );
        let shared = Arc::new_cyclic(|self_ref| StoreShared {
            state: RwLock::new(CacheState::new(&config)),
            config,
            clock,
            stats: Mutex::new(CacheStats::new()),
            timer: Mutex::new(None),
            self_ref: self_ref.clone(),
        });
        Self { shared }
    }

    // == Get ==
    /// Retrieves a value by key.
    ///
    /// An entry whose dependency changed or whose deadline passed goes through
    /// its update callback, run without the lock held; the replacement value
    /// is returned if there is one, otherwise the entry is removed and None is
    /// returned. While that callback runs, reads of the key miss. Reading an
    /// entry with sliding expiration pushes its deadline out.
    pub fn get(&self, key: &str) -> Option<V> {
        let shared = &*self.shared;
        let mut removals = Vec::new();

        let mut pending = None;
        let value = {
            let guard = shared.state.upgradable_read();
            match guard.index.peek(key) {
                None => None,
                Some(id) => {
                    let now = shared.clock.now();
                    let stale = shared.staleness(&guard, id, now);
                    let entry = &guard.arena[id];
                    let renew = stale.is_none()
                        && !shared.config.disable_expiration
                        && entry.sliding_expiration.is_some();
                    let touch = stale.is_none()
                        && entry.is_removable()
                        && !guard.index.is_most_recent(id);

                    match stale {
                        // Its update callback is running; nothing to serve yet
                        Some(_) if entry.refreshing => None,
                        Some(reason) => {
                            let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
                            pending = shared.expire_locked(&mut guard, id, reason, &mut removals);
                            None
                        }
                        None if !renew && !touch => entry.value.clone(),
                        None => {
                            let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
                            let state = &mut *guard;
                            state.index.touch(&mut state.arena, id);
                            if renew {
                                shared.renew_sliding_locked(state, id, now);
                            }
                            state.arena[id].value.clone()
                        }
                    }
                }
            }
        };
        shared.finish(removals);

        let value = match pending.map(|refresh| shared.refresh(refresh)) {
            Some(RefreshOutcome::Replaced(value)) => value,
            Some(_) => None,
            None => value,
        };

        {
            let mut stats = shared.stats.lock();
            if value.is_some() {
                stats.record_hit();
            } else {
                stats.record_miss();
            }
        }
        value
    }

    // == Insert ==
    /// Stores a value that never expires, replacing any entry under `key`.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Result<()> {
        self.insert_with(key, value, CacheItemOptions::new())
    }

    /// Stores a value that is invalidated when `dependency` changes.
    pub fn insert_with_dependency(
        &self,
        key: impl Into<String>,
        value: V,
        dependency: impl Into<CacheDependency>,
    ) -> Result<()> {
        self.insert_with(key, value, CacheItemOptions::new().dependency(dependency))
    }

    /// Stores a value with an optional dependency and either an absolute or a
    /// sliding expiration.
    pub fn insert_with_expiration(
        &self,
        key: impl Into<String>,
        value: V,
        dependency: Option<CacheDependency>,
        absolute_expiration: Option<DateTime<Utc>>,
        sliding_expiration: Option<Duration>,
    ) -> Result<()> {
        let options = CacheItemOptions {
            dependency,
            absolute_expiration,
            sliding_expiration,
            ..CacheItemOptions::new()
        };
        self.insert_with(key, value, options)
    }

    /// Like `insert_with_expiration`, with a callback that may refresh the
    /// value instead of letting it go.
    pub fn insert_with_update_callback<F>(
        &self,
        key: impl Into<String>,
        value: V,
        dependency: Option<CacheDependency>,
        absolute_expiration: Option<DateTime<Utc>>,
        sliding_expiration: Option<Duration>,
        on_update: F,
    ) -> Result<()>
    where
        F: Fn(&str, CacheItemUpdateReason) -> anyhow::Result<Option<CacheItemUpdate<V>>>
            + Send
            + Sync
            + 'static,
    {
        let options = CacheItemOptions {
            dependency,
            absolute_expiration,
            sliding_expiration,
            ..CacheItemOptions::new()
        }
        .on_update(on_update);
        self.insert_with(key, value, options)
    }

    /// Stores a value with full control over its options.
    ///
    /// An entry already stored under `key` is removed with reason `Removed`.
    pub fn insert_with(&self, key: impl Into<String>, value: V, options: CacheItemOptions<V>) -> Result<()> {
        let key = validate_key(key.into())?;
        options.validate()?;

        let shared = &*self.shared;
        if let Some(dependency) = &options.dependency {
            dependency.attach(shared.host_ref())?;
        }

        let mut removals = Vec::new();
        {
            let mut guard = shared.state.write();
            let state = &mut *guard;
            let now = shared.clock.now();
            shared.store_entry_locked(state, key, value, options, now, &mut removals);
            shared.evict_if_necessary_locked(state, &mut removals);
        }
        shared.stats.lock().record_insert();
        shared.finish(removals);
        Ok(())
    }

    // == Add ==
    /// Stores a value only if `key` is not present.
    ///
    /// Returns the value already stored under `key`, or None if the new value
    /// was inserted.
    pub fn add(&self, key: impl Into<String>, value: V, options: CacheItemOptions<V>) -> Result<Option<V>> {
        let key = validate_key(key.into())?;
        options.validate()?;

        let shared = &*self.shared;
        let mut removals = Vec::new();
        {
            let mut guard = shared.state.write();
            let state = &mut *guard;
            if let Some(id) = state.index.get(&mut state.arena, &key) {
                return Ok(state.arena[id].value.clone());
            }

            if let Some(dependency) = &options.dependency {
                dependency.attach(shared.host_ref())?;
            }
            let now = shared.clock.now();
            shared.store_entry_locked(state, key, value, options, now, &mut removals);
            shared.evict_if_necessary_locked(state, &mut removals);
        }
        shared.stats.lock().record_insert();
        shared.finish(removals);
        Ok(None)
    }

    // == Remove ==
    /// Removes an entry, invoking its removal callback with reason `Removed`.
    ///
    /// Returns the removed value.
    pub fn remove(&self, key: &str) -> Option<V> {
        let shared = &*self.shared;
        let mut removals = Vec::new();
        let value = {
            let mut guard = shared.state.write();
            shared.remove_locked(&mut guard, key, CacheItemRemovedReason::Removed, &mut removals)
        };
        shared.finish(removals);
        value
    }

    // == Check Dependencies ==
    /// Refreshes or removes every entry whose dependency has changed.
    pub fn check_dependencies(&self) {
        self.shared.check_dependencies_now();
    }

    // == Set Item Timeout ==
    /// Changes the expiration of an existing entry in place.
    ///
    /// Returns false if `key` is not in the cache.
    pub fn set_item_timeout(
        &self,
        key: &str,
        absolute_expiration: Option<DateTime<Utc>>,
        sliding_expiration: Option<Duration>,
    ) -> Result<bool> {
        validate_expiration(absolute_expiration, sliding_expiration)?;
        let sliding = normalize_sliding(sliding_expiration);

        let shared = &*self.shared;
        let mut guard = shared.state.write();
        let state = &mut *guard;
        let Some(id) = state.index.peek(key) else {
            return Ok(false);
        };

        let now = shared.clock.now();
        let entry = &mut state.arena[id];
        entry.sliding_expiration = sliding;
        entry.absolute_expiration = match sliding {
            Some(sliding) => Some(add_duration(now, sliding)),
            None => absolute_expiration,
        };

        match shared.deadline_of(&state.arena[id]) {
            Some(deadline) => {
                if !state.heap.update(&mut state.arena, id, deadline) {
                    state.heap.enqueue(&mut state.arena, id, deadline);
                }
                shared.arm_timer(deadline);
            }
            None => {
                state.heap.remove(&mut state.arena, id);
            }
        }
        Ok(true)
    }

    // == Cleanup Expired ==
    /// Runs one expiration sweep now.
    ///
    /// Returns the number of entries removed as expired.
    pub fn cleanup_expired(&self) -> usize {
        let (expired, next) = self.shared.sweep_now();
        if let Some(next) = next {
            self.shared.arm_timer(next);
        }
        expired
    }

    // == Accessors ==
    /// Time `key` was last inserted, or None if it is not in the cache.
    pub fn key_last_change(&self, key: &str) -> Option<DateTime<Utc>> {
        self.shared.state.read().last_change(key)
    }

    /// Whether `key` is stored, without touching its recency or expiration.
    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.state.read().index.peek(key).is_some()
    }

    /// Returns the current number of entries in the cache.
    pub fn len(&self) -> usize {
        self.shared.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.set_total_entries(self.len());
        stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    /// Advisory private bytes limit.
    pub fn effective_private_bytes_limit(&self) -> u64 {
        self.shared.config.effective_private_bytes_limit()
    }

    /// Advisory physical memory percentage limit.
    pub fn effective_percentage_physical_memory_limit(&self) -> u64 {
        self.shared.config.effective_percentage_physical_memory_limit()
    }

    // == Dependencies ==
    /// Dependency builder on this store's clock.
    pub fn dependency_builder(&self) -> CacheDependencyBuilder {
        CacheDependency::builder().clock(self.shared.clock.clone())
    }

    /// Empty aggregate dependency on this store's clock.
    pub fn aggregate_dependency(&self) -> AggregateCacheDependency {
        AggregateCacheDependency::with_clock(self.shared.clock.clone())
    }

    // == Iterate ==
    /// Snapshot of every `(key, value)` pair, in no particular order.
    pub fn iter(&self) -> CacheEnumerator<V> {
        let guard = self.shared.state.read();
        let items: Vec<(String, V)> = guard
            .index
            .snapshot()
            .into_iter()
            .filter_map(|id| {
                let entry = &guard.arena[id];
                entry.value.clone().map(|value| (entry.key.clone(), value))
            })
            .collect();
        CacheEnumerator::new(items)
    }
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V> Default for CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::from_parts(CacheConfig::default(), Arc::new(SystemClock))
    }
}

impl<V> fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("CacheStore")
            .field("len", &state.index.len())
            .field("pending_deadlines", &state.heap.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl<'a, V> IntoIterator for &'a CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Item = (String, V);
    type IntoIter = CacheEnumerator<V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
