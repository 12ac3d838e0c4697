//! Registry of live watch handles.
//!
//! Handles own a [`WatchTarget`]. Several handles may point at the same path;
//! the registry refcounts paths so the OS-level watch is acquired with the
//! first handle and released with the last.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};
use crate::event::{ChangeKind, ChangeKinds};

/// Identifier of a watch handle. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered path and the change kinds it cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    path: PathBuf,
    kinds: ChangeKinds,
    recursive: bool,
}

impl WatchTarget {
    /// `path` must already be normalized.
    pub fn new(path: PathBuf, kinds: ChangeKinds, recursive: bool) -> Self {
        Self {
            path,
            kinds,
            recursive,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kinds(&self) -> ChangeKinds {
        self.kinds
    }

    /// Whether a change at `path` falls under this target.
    pub fn covers(&self, path: &Path) -> bool {
        if path == self.path {
            return true;
        }
        if self.recursive {
            return path.starts_with(&self.path);
        }
        path.parent() == Some(self.path.as_path())
    }
}

/// Ownership token for a registered watch.
///
/// Not `Clone`: whoever holds it is the only party that can release it.
#[derive(Debug, PartialEq, Eq)]
pub struct WatchHandle {
    id: HandleId,
    path: PathBuf,
}

impl WatchHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Normalized path of the watched target.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of releasing a handle.
#[derive(Debug)]
pub struct Released {
    pub target: WatchTarget,

    /// True if no other handle references the path anymore.
    pub last_for_path: bool,
}

/// Tracks active handles so they can be enumerated and released.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    next_id: u64,
    targets: BTreeMap<HandleId, WatchTarget>,
    path_refs: HashMap<PathBuf, usize>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. The flag is true when this is the first handle on
    /// the path, meaning the caller must acquire the OS watch.
    pub fn insert(&mut self, target: WatchTarget) -> (WatchHandle, bool) {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        let path = target.path.clone();

        let refs = self.path_refs.entry(path.clone()).or_insert(0);
        *refs += 1;
        let first = *refs == 1;

        self.targets.insert(id, target);
        (WatchHandle { id, path }, first)
    }

    /// Release one handle.
    pub fn release(&mut self, id: HandleId) -> Result<Released> {
        let target = self
            .targets
            .remove(&id)
            .ok_or(WatcherError::AlreadyReleased(id))?;
        let last_for_path = self.drop_path_ref(&target.path);

        Ok(Released {
            target,
            last_for_path,
        })
    }

    /// Release every handle registered on exactly `path`.
    pub fn release_path(&mut self, path: &Path) -> Vec<HandleId> {
        let ids: Vec<HandleId> = self
            .targets
            .iter()
            .filter(|(_, t)| t.path == path)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            self.targets.remove(id);
        }
        self.path_refs.remove(path);
        ids
    }

    /// Release everything. Returns the number of handles released and the
    /// distinct paths whose OS watches must be dropped.
    pub fn drain(&mut self) -> (usize, Vec<PathBuf>) {
        let released = self.targets.len();
        self.targets.clear();
        let paths = self.path_refs.drain().map(|(p, _)| p).collect();
        (released, paths)
    }

    fn drop_path_ref(&mut self, path: &Path) -> bool {
        match self.path_refs.get_mut(path) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
                false
            }
            Some(_) => {
                self.path_refs.remove(path);
                true
            }
            None => true,
        }
    }

    /// Whether any live target covers `path` and wants `kind`.
    pub fn is_interested(&self, path: &Path, kind: ChangeKind) -> bool {
        self.targets
            .values()
            .any(|t| t.kinds.contains(kind) && t.covers(path))
    }

    /// Whether `path` is itself a registered target.
    pub fn is_target(&self, path: &Path) -> bool {
        self.path_refs.contains_key(path)
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.targets.contains_key(&id)
    }

    /// Ids of live handles, in registration order.
    pub fn active_ids(&self) -> Vec<HandleId> {
        self.targets.keys().copied().collect()
    }

    /// Whether the OS watch on target `path` is recursive, if `path` is a target.
    pub fn recursive_for(&self, path: &Path) -> Option<bool> {
        self.targets
            .values()
            .find(|t| t.path == path)
            .map(|t| t.recursive)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Number of distinct watched paths.
    pub fn path_count(&self) -> usize {
        self.path_refs.len()
    }
}
