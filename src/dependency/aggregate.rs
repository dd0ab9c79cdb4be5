//! Aggregate Dependency Module
//!
//! A dependency that changes as soon as any of its members does.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{CacheDependency, DependencyInner, DependencyKind};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheError, Result};

// == Aggregate Cache Dependency ==
/// Groups several dependencies behind one.
///
/// ```ignore
/// let aggregate = AggregateCacheDependency::new();
/// aggregate.add([CacheDependency::on_files(["app.toml"])?, CacheDependency::on_keys(["rates"])])?;
/// store.insert_with_dependency("config", config, aggregate)?;
/// ```
#[derive(Debug, Clone)]
pub struct AggregateCacheDependency {
    dependency: CacheDependency,
}

impl AggregateCacheDependency {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let start = clock.now();
        Self {
            dependency: CacheDependency::from_inner(DependencyInner::new(
                DependencyKind::Aggregate,
                start,
                Vec::new(),
                Vec::new(),
                clock,
            )),
        }
    }

    // == Add ==
    /// Adds members to the aggregate.
    ///
    /// Either every member is added or none is: a member that is already
    /// owned, disposed, or listed twice fails the whole call. If a member has
    /// already changed, the aggregate changes immediately.
    pub fn add<I>(&self, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = CacheDependency>,
    {
        if self.dependency.is_disposed() {
            return Err(CacheError::DependencyDisposed);
        }

        let members: Vec<CacheDependency> = dependencies.into_iter().collect();
        for (position, member) in members.iter().enumerate() {
            if member.is_disposed() {
                return Err(CacheError::DependencyDisposed);
            }
            let duplicate = members[..position].iter().any(|other| other.ptr_eq(member));
            if member.is_used() || duplicate || member.ptr_eq(&self.dependency) {
                return Err(CacheError::DependencyInUse);
            }
        }

        for member in &members {
            member.adopt(&self.dependency)?;
        }
        let already_changed = members.iter().any(CacheDependency::has_changed);
        self.dependency.push_children(members);

        if already_changed {
            self.dependency.inner.on_child_changed();
        }
        Ok(())
    }

    // == Accessors ==
    pub fn has_changed(&self) -> bool {
        self.dependency.has_changed()
    }

    /// Concatenation of the members' unique ids.
    pub fn unique_id(&self) -> String {
        self.dependency.unique_id()
    }

    pub fn utc_last_modified(&self) -> DateTime<Utc> {
        self.dependency.utc_last_modified()
    }

    pub fn len(&self) -> usize {
        self.dependency.inner.state.lock().children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle usable wherever a `CacheDependency` is expected.
    pub fn as_dependency(&self) -> CacheDependency {
        self.dependency.clone()
    }
}

impl Default for AggregateCacheDependency {
    fn default() -> Self {
        Self::new()
    }
}

impl From<AggregateCacheDependency> for CacheDependency {
    fn from(aggregate: AggregateCacheDependency) -> Self {
        aggregate.dependency
    }
}
