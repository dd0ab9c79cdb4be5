//! Dependency Module
//!
//! Dependencies watch something outside a cache entry (files, other cache
//! keys, another dependency) and tell the owning store once it changes.
//!
//! # Lifecycle
//! A dependency is created detached, then owned by exactly one cache entry or
//! parent dependency. It changes at most once (the flag is sticky) and is
//! disposed when its owner goes away, which releases its file watches and
//! disposes its child.

mod aggregate;
mod watcher;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};

pub use aggregate::AggregateCacheDependency;
use watcher::FileWatcher;

// == Host Seams ==
/// Resolves a cache key to the time it was last inserted.
pub(crate) trait KeyLookup {
    /// None when the key is not in the cache.
    fn last_change(&self, key: &str) -> Option<DateTime<Utc>>;
}

/// The store side of an attached dependency.
pub(crate) trait DependencyHost: Send + Sync {
    /// Takes the store's read lock.
    fn key_last_change(&self, key: &str) -> Option<DateTime<Utc>>;

    /// Re-checks every dependency-bearing entry; takes the store's write lock.
    fn check_dependencies(&self);
}

struct HostLookup<'a>(&'a dyn DependencyHost);

impl KeyLookup for HostLookup<'_> {
    fn last_change(&self, key: &str) -> Option<DateTime<Utc>> {
        self.0.key_last_change(key)
    }
}

// == Owner ==
/// Single listener a dependency reports its change to.
#[derive(Clone, Default)]
enum Owner {
    #[default]
    Detached,
    Store(Weak<dyn DependencyHost>),
    Parent(Weak<DependencyInner>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DependencyKind {
    Standard,
    Aggregate,
}

struct DependencyState {
    has_changed: bool,
    used: bool,
    disposed: bool,
    utc_last_modified: DateTime<Utc>,
    watchers: Vec<FileWatcher>,
    /// The child of a standard dependency, or the members of an aggregate
    children: Vec<CacheDependency>,
    owner: Owner,
}

struct DependencyInner {
    kind: DependencyKind,
    /// Changes observed before this instant are ignored
    start: DateTime<Utc>,
    cache_keys: Vec<String>,
    paths: Vec<PathBuf>,
    clock: Arc<dyn Clock>,
    state: Mutex<DependencyState>,
}

impl DependencyInner {
    fn new(
        kind: DependencyKind,
        start: DateTime<Utc>,
        cache_keys: Vec<String>,
        paths: Vec<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let created = clock.now();
        Self {
            kind,
            start,
            cache_keys,
            paths,
            clock,
            state: Mutex::new(DependencyState {
                has_changed: false,
                used: false,
                disposed: false,
                utc_last_modified: created,
                watchers: Vec::new(),
                children: Vec::new(),
                owner: Owner::Detached,
            }),
        }
    }

    /// Records a change and forwards it to the owner.
    fn fire(&self) {
        let now = self.clock.now();
        let (owner, watchers) = {
            let mut state = self.state.lock();
            if state.disposed || now < self.start {
                return;
            }
            state.has_changed = true;
            state.utc_last_modified = now;
            (state.owner.clone(), std::mem::take(&mut state.watchers))
        };
        watcher::release_watchers(watchers);

        match owner {
            Owner::Store(host) => {
                if let Some(host) = host.upgrade() {
                    host.check_dependencies();
                }
            }
            Owner::Parent(parent) => {
                if let Some(parent) = parent.upgrade() {
                    parent.on_child_changed();
                }
            }
            Owner::Detached => {}
        }
    }

    fn on_child_changed(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.has_changed = true;
        }
        self.fire();
    }

    /// Sets the sticky flag found by lazy evaluation; the owner is not notified.
    fn mark_changed(&self, now: DateTime<Utc>) {
        let watchers = {
            let mut state = self.state.lock();
            if !state.has_changed {
                state.has_changed = true;
                state.utc_last_modified = now;
            }
            std::mem::take(&mut state.watchers)
        };
        watcher::release_watchers(watchers);
    }

    fn find_host(&self) -> Option<Arc<dyn DependencyHost>> {
        let owner = self.state.lock().owner.clone();
        match owner {
            Owner::Store(host) => host.upgrade(),
            Owner::Parent(parent) => parent.upgrade()?.find_host(),
            Owner::Detached => None,
        }
    }
}

// == Cache Dependency ==
/// Handle to a dependency. Clones share the same state.
#[derive(Clone)]
pub struct CacheDependency {
    inner: Arc<DependencyInner>,
}

impl CacheDependency {
    /// Starts building a dependency on files, cache keys and/or a child.
    pub fn builder() -> CacheDependencyBuilder {
        CacheDependencyBuilder::new()
    }

    /// Dependency on files or directories, monitored from now on.
    pub fn on_files<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::builder().files(paths).build()
    }

    /// Dependency on other keys of the store it is attached to.
    ///
    /// A key that is overwritten after the dependency was created, or that is
    /// missing from the store, counts as changed.
    pub fn on_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let start = clock.now();
        Self::from_inner(DependencyInner::new(
            DependencyKind::Standard,
            start,
            keys.into_iter().map(Into::into).collect(),
            Vec::new(),
            clock,
        ))
    }

    fn from_inner(inner: DependencyInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    // == Has Changed ==
    /// Whether the watched resources changed since the start time.
    ///
    /// Once true, stays true. Cache keys are resolved against the owning
    /// store, so this takes the store's read lock and must not be called from
    /// inside an update callback.
    pub fn has_changed(&self) -> bool {
        match self.inner.find_host() {
            Some(host) => self.evaluate(Some(&HostLookup(host.as_ref()))),
            None => self.evaluate(None),
        }
    }

    /// Same as `has_changed` with the store state already locked by the caller.
    pub(crate) fn has_changed_in(&self, lookup: &dyn KeyLookup) -> bool {
        self.evaluate(Some(lookup))
    }

    fn evaluate(&self, lookup: Option<&dyn KeyLookup>) -> bool {
        let children = {
            let state = self.inner.state.lock();
            if state.has_changed {
                return true;
            }
            state.children.clone()
        };

        let now = self.inner.clock.now();
        if now < self.inner.start {
            return false;
        }

        let start = self.inner.start;
        let keys_changed = lookup.is_some_and(|lookup| {
            self.inner
                .cache_keys
                .iter()
                .any(|key| lookup.last_change(key).map_or(true, |changed| changed > start))
        });
        let changed = keys_changed || children.iter().any(|child| child.evaluate(lookup));

        if changed {
            debug!(keys = ?self.inner.cache_keys, "Cache dependency changed");
            self.inner.mark_changed(now);
        }
        changed
    }

    // == Notify ==
    /// Signals that the watched resource changed.
    ///
    /// Hosts use this to build their own dependency kinds, e.g. a poller that
    /// owns a key-less dependency and fires it when its source moves. Must not
    /// be called while holding the store's lock.
    pub fn notify_changed(&self) {
        self.inner.fire();
    }

    // == Accessors ==
    /// Last time a change was recorded, or the creation time if none was.
    pub fn utc_last_modified(&self) -> DateTime<Utc> {
        self.inner.state.lock().utc_last_modified
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.inner.start
    }

    /// Whether a cache entry or a parent dependency owns this dependency.
    pub fn is_used(&self) -> bool {
        self.inner.state.lock().used
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub fn cache_keys(&self) -> &[String] {
        &self.inner.cache_keys
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.inner.paths
    }

    /// Identifier built from the watched paths and keys.
    pub fn unique_id(&self) -> String {
        match self.inner.kind {
            DependencyKind::Standard => {
                let paths = self
                    .inner
                    .paths
                    .iter()
                    .filter(|path| !path.as_os_str().is_empty())
                    .map(|path| format!("_{}", path.display()));
                let keys = self.inner.cache_keys.iter().map(|key| format!("_{key}"));
                paths.chain(keys).collect()
            }
            DependencyKind::Aggregate => {
                let children = self.inner.state.lock().children.clone();
                children.iter().map(CacheDependency::unique_id).collect()
            }
        }
    }

    // == Ownership ==
    /// Makes `host` the owner of this dependency.
    pub(crate) fn attach(&self, host: Weak<dyn DependencyHost>) -> Result<()> {
        self.claim(Owner::Store(host))
    }

    /// Makes `parent` the owner of this dependency.
    pub(crate) fn adopt(&self, parent: &CacheDependency) -> Result<()> {
        self.claim(Owner::Parent(Arc::downgrade(&parent.inner)))
    }

    fn claim(&self, owner: Owner) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(CacheError::DependencyDisposed);
        }
        if state.used {
            return Err(CacheError::DependencyInUse);
        }
        state.used = true;
        state.owner = owner;
        Ok(())
    }

    fn push_children(&self, children: Vec<CacheDependency>) {
        self.inner.state.lock().children.extend(children);
    }

    // == Dispose ==
    /// Releases file watches, detaches from the owner and disposes children.
    pub(crate) fn dispose(&self) {
        let (watchers, children) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.used = false;
            state.owner = Owner::Detached;
            (
                std::mem::take(&mut state.watchers),
                std::mem::take(&mut state.children),
            )
        };
        watcher::release_watchers(watchers);
        for child in children {
            child.dispose();
        }
    }

    pub(crate) fn ptr_eq(&self, other: &CacheDependency) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn start_watching(&self) -> Result<()> {
        let target = Arc::downgrade(&self.inner);
        let mut watchers = Vec::new();
        for path in &self.inner.paths {
            if let Some(watch) = watcher::watch_path(path, target.clone())? {
                watchers.push(watch);
            }
        }
        self.inner.state.lock().watchers = watchers;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.state.lock().watchers.len()
    }
}

impl fmt::Debug for CacheDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CacheDependency")
            .field("kind", &self.inner.kind)
            .field("start", &self.inner.start)
            .field("cache_keys", &self.inner.cache_keys)
            .field("paths", &self.inner.paths)
            .field("children", &state.children.len())
            .field("has_changed", &state.has_changed)
            .field("used", &state.used)
            .finish()
    }
}

// == Builder ==
/// Builder for a standard dependency.
#[derive(Debug)]
pub struct CacheDependencyBuilder {
    paths: Vec<PathBuf>,
    cache_keys: Vec<String>,
    child: Option<CacheDependency>,
    start: Option<DateTime<Utc>>,
    clock: Arc<dyn Clock>,
}

impl CacheDependencyBuilder {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            cache_keys: Vec::new(),
            child: None,
            start: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Watches a file or directory.
    #[must_use]
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    #[must_use]
    pub fn files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.paths.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Watches another key of the owning store.
    #[must_use]
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_keys.push(key.into());
        self
    }

    #[must_use]
    pub fn cache_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Makes this dependency change whenever `child` does.
    #[must_use]
    pub fn child(mut self, child: CacheDependency) -> Self {
        self.child = Some(child);
        self
    }

    /// Ignores changes before `start` (defaults to now).
    #[must_use]
    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Creates the dependency and starts watching its paths.
    ///
    /// Paths whose directory does not exist are skipped.
    pub fn build(self) -> Result<CacheDependency> {
        if let Some(child) = &self.child {
            if child.is_disposed() {
                return Err(CacheError::DependencyDisposed);
            }
            if child.is_used() {
                return Err(CacheError::DependencyInUse);
            }
        }

        let start = self.start.unwrap_or_else(|| self.clock.now());
        let dependency = CacheDependency::from_inner(DependencyInner::new(
            DependencyKind::Standard,
            start,
            self.cache_keys,
            self.paths,
            self.clock,
        ));
        dependency.start_watching()?;

        if let Some(child) = self.child {
            child.adopt(&dependency)?;
            dependency.push_children(vec![child]);
        }
        Ok(dependency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Keys(HashMap<String, DateTime<Utc>>);

    impl KeyLookup for Keys {
        fn last_change(&self, key: &str) -> Option<DateTime<Utc>> {
            self.0.get(key).copied()
        }
    }

    #[derive(Default)]
    struct CountingHost {
        checks: AtomicUsize,
    }

    impl DependencyHost for CountingHost {
        fn key_last_change(&self, _key: &str) -> Option<DateTime<Utc>> {
            None
        }

        fn check_dependencies(&self) {
            self.checks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::default())
    }

    fn key_dependency(clock: &Arc<ManualClock>, keys: &[&str]) -> CacheDependency {
        CacheDependency::builder()
            .cache_keys(keys.iter().copied())
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn test_unchanged_key_dependency() {
        let clock = manual_clock();
        let start = clock.now();
        let dependency = key_dependency(&clock, &["a"]);

        let keys = Keys(HashMap::from([("a".to_string(), start)]));
        clock.advance(Duration::from_secs(1));

        assert!(!dependency.has_changed_in(&keys));
    }

    #[test]
    fn test_key_changed_after_start() {
        let clock = manual_clock();
        let dependency = key_dependency(&clock, &["a"]);

        clock.advance(Duration::from_secs(1));
        let keys = Keys(HashMap::from([("a".to_string(), clock.now())]));

        assert!(dependency.has_changed_in(&keys));
    }

    #[test]
    fn test_missing_key_counts_as_changed() {
        let clock = manual_clock();
        let dependency = key_dependency(&clock, &["gone"]);

        assert!(dependency.has_changed_in(&Keys(HashMap::new())));
    }

    #[test]
    fn test_changed_is_sticky() {
        let clock = manual_clock();
        let dependency = key_dependency(&clock, &["a"]);

        clock.advance(Duration::from_secs(1));
        let changed = Keys(HashMap::from([("a".to_string(), clock.now())]));
        assert!(dependency.has_changed_in(&changed));

        // The key "reverts", the dependency does not
        let reverted = Keys(HashMap::from([("a".to_string(), dependency.start())]));
        assert!(dependency.has_changed_in(&reverted));
        assert!(dependency.has_changed());
    }

    #[test]
    fn test_changes_before_start_are_ignored() {
        let clock = manual_clock();
        let start = clock.now() + chrono::Duration::seconds(60);
        let dependency = CacheDependency::builder()
            .cache_key("a")
            .start(start)
            .clock(clock.clone())
            .build()
            .unwrap();

        assert!(!dependency.has_changed_in(&Keys(HashMap::new())));

        dependency.notify_changed();
        assert!(!dependency.has_changed());

        clock.advance(Duration::from_secs(61));
        dependency.notify_changed();
        assert!(dependency.has_changed());
    }

    #[test]
    fn test_detached_dependency_ignores_keys() {
        let dependency = CacheDependency::on_keys(["a"]);
        assert!(!dependency.has_changed());
    }

    #[test]
    fn test_notify_changed_reaches_host() {
        let host = Arc::new(CountingHost::default());
        let dependency = CacheDependency::on_keys(Vec::<String>::new());
        let weak: Weak<dyn DependencyHost> = Arc::downgrade(&host) as Weak<dyn DependencyHost>;
        dependency.attach(weak).unwrap();

        let before = dependency.utc_last_modified();
        dependency.notify_changed();

        assert!(dependency.has_changed());
        assert_eq!(host.checks.load(Ordering::SeqCst), 1);
        assert!(dependency.utc_last_modified() >= before);
    }

    #[test]
    fn test_attach_twice_fails() {
        let host = Arc::new(CountingHost::default());
        let dependency = CacheDependency::on_keys(["a"]);
        let weak: Weak<dyn DependencyHost> = Arc::downgrade(&host) as Weak<dyn DependencyHost>;

        dependency.attach(weak.clone()).unwrap();
        assert!(dependency.is_used());
        assert!(matches!(
            dependency.attach(weak),
            Err(CacheError::DependencyInUse)
        ));
    }

    #[test]
    fn test_disposed_dependency_rejects_attach_and_ignores_changes() {
        let host = Arc::new(CountingHost::default());
        let dependency = CacheDependency::on_keys(["a"]);
        let weak: Weak<dyn DependencyHost> = Arc::downgrade(&host) as Weak<dyn DependencyHost>;
        dependency.attach(weak.clone()).unwrap();

        dependency.dispose();
        dependency.notify_changed();

        assert!(dependency.is_disposed());
        assert!(!dependency.is_used());
        assert_eq!(host.checks.load(Ordering::SeqCst), 0);
        assert!(matches!(
            dependency.attach(weak),
            Err(CacheError::DependencyDisposed)
        ));
    }

    #[test]
    fn test_child_change_is_forwarded() {
        let host = Arc::new(CountingHost::default());
        let child = CacheDependency::on_keys(Vec::<String>::new());
        let parent = CacheDependency::builder().child(child.clone()).build().unwrap();
        let weak: Weak<dyn DependencyHost> = Arc::downgrade(&host) as Weak<dyn DependencyHost>;
        parent.attach(weak).unwrap();

        assert!(child.is_used());
        child.notify_changed();

        assert!(parent.has_changed());
        assert_eq!(host.checks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_keys_evaluated_through_parent() {
        let clock = manual_clock();
        let child = key_dependency(&clock, &["a"]);
        let parent = CacheDependency::builder()
            .child(child)
            .clock(clock.clone())
            .build()
            .unwrap();

        assert!(parent.has_changed_in(&Keys(HashMap::new())));
    }

    #[test]
    fn test_used_dependency_cannot_be_child() {
        let child = CacheDependency::on_keys(["a"]);
        CacheDependency::builder().child(child.clone()).build().unwrap();

        let result = CacheDependency::builder().child(child).build();
        assert!(matches!(result, Err(CacheError::DependencyInUse)));
    }

    #[test]
    fn test_dispose_disposes_child() {
        let child = CacheDependency::on_keys(["a"]);
        let parent = CacheDependency::builder().child(child.clone()).build().unwrap();

        parent.dispose();

        assert!(child.is_disposed());
    }

    #[test]
    fn test_unique_id() {
        let dependency = CacheDependency::builder()
            .file("/tmp/does-not-exist/settings.json")
            .cache_keys(["a", "b"])
            .build()
            .unwrap();

        assert_eq!(
            dependency.unique_id(),
            "_/tmp/does-not-exist/settings.json_a_b"
        );
    }

    #[test]
    fn test_missing_directory_is_skipped() {
        let dependency =
            CacheDependency::on_files(["/definitely/not/a/real/dir/file.txt"]).unwrap();

        assert_eq!(dependency.watcher_count(), 0);
        assert!(!dependency.has_changed());
    }
}
