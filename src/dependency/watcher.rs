//! File Watcher Module
//!
//! Bridges filesystem notifications to a dependency's change signal.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::thread;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use super::DependencyInner;
use crate::error::Result;

// == File Watcher ==
/// A live OS watch. Dropping it stops the notifications.
pub(super) struct FileWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").field("root", &self.root).finish()
    }
}

/// Starts watching `path` on behalf of `target`.
///
/// A directory is watched directly. A file is watched through its parent
/// directory, filtered on the file name, so creating a file that did not
/// exist yet also counts as a change. Returns None for an empty path or a
/// path whose directory does not exist.
pub(super) fn watch_path(path: &Path, target: Weak<DependencyInner>) -> Result<Option<FileWatcher>> {
    if path.as_os_str().is_empty() {
        return Ok(None);
    }

    let (root, file_name) = if path.is_dir() {
        (path.to_path_buf(), None)
    } else {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) if parent.is_dir() => {
                (parent.to_path_buf(), Some(name.to_os_string()))
            }
            _ => {
                debug!(path = %path.display(), "Skipping watch, directory does not exist");
                return Ok(None);
            }
        }
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if !is_relevant(&event, file_name.as_deref()) {
                return;
            }
            if let Some(inner) = target.upgrade() {
                debug!(paths = ?event.paths, "Watched path changed");
                inner.fire();
            }
        }
        Err(e) => warn!("File watch error: {}", e),
    })?;
    watcher.watch(&root, RecursiveMode::NonRecursive)?;

    debug!(root = %root.display(), "Watching path");
    Ok(Some(FileWatcher {
        _watcher: watcher,
        root,
    }))
}

fn is_relevant(event: &Event, file_name: Option<&OsStr>) -> bool {
    let changed = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );
    changed
        && file_name.map_or(true, |name| {
            event.paths.iter().any(|path| path.file_name() == Some(name))
        })
}

/// Drops watchers that are no longer needed, off the calling thread.
///
/// Some backends join their event thread on drop. That thread may be inside
/// our own callback or waiting on the store lock held by the caller.
pub(super) fn release_watchers(watchers: Vec<FileWatcher>) {
    if watchers.is_empty() {
        return;
    }
    let spawned = thread::Builder::new()
        .name("cache-watch-release".into())
        .spawn(move || drop(watchers));
    if let Err(e) = spawned {
        warn!("Failed to release file watchers: {}", e);
    }
}
