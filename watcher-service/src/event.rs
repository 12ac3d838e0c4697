//! Change events produced by the watcher service.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use serde::{Deserialize, Serialize};

/// Kind of change reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// File or directory was created.
    Created,

    /// Contents or metadata changed.
    Modified,

    /// File or directory was removed.
    Removed,

    /// File or directory was renamed.
    Renamed,
}

impl ChangeKind {
    /// All kinds, in declaration order.
    pub const ALL: [ChangeKind; 4] = [
        ChangeKind::Created,
        ChangeKind::Modified,
        ChangeKind::Removed,
        ChangeKind::Renamed,
    ];

    /// Wire name used by the renderer channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Removed => "removed",
            Self::Renamed => "renamed",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Modified => 1 << 1,
            Self::Removed => 1 << 2,
            Self::Renamed => 1 << 3,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of change kinds a watch target is interested in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<ChangeKind>", into = "Vec<ChangeKind>")]
pub struct ChangeKinds(u8);

impl ChangeKinds {
    /// The empty set.
    pub fn none() -> Self {
        Self(0)
    }

    /// Every kind.
    pub fn all() -> Self {
        ChangeKind::ALL.into_iter().collect()
    }

    /// Add a kind to the set.
    pub fn with(mut self, kind: ChangeKind) -> Self {
        self.0 |= kind.bit();
        self
    }

    pub fn contains(self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the kinds in the set.
    pub fn iter(self) -> impl Iterator<Item = ChangeKind> {
        ChangeKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl Default for ChangeKinds {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ChangeKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl From<ChangeKind> for ChangeKinds {
    fn from(kind: ChangeKind) -> Self {
        Self::none().with(kind)
    }
}

impl FromIterator<ChangeKind> for ChangeKinds {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

impl From<Vec<ChangeKind>> for ChangeKinds {
    fn from(kinds: Vec<ChangeKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<ChangeKinds> for Vec<ChangeKind> {
    fn from(kinds: ChangeKinds) -> Self {
        kinds.iter().collect()
    }
}

/// An application-level change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Path to the affected file or directory.
    pub path: PathBuf,

    /// The kind of change.
    pub kind: ChangeKind,

    /// When the change was first observed.
    pub timestamp: DateTime<Utc>,

    /// Destination path for renames, when the OS reported it.
    pub new_path: Option<PathBuf>,
}

impl ChangeEvent {
    /// Create a new change event stamped with the current time.
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
            new_path: None,
        }
    }

    /// Create a rename event.
    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            new_path: Some(to.into()),
            ..Self::new(ChangeKind::Renamed, from)
        }
    }
}

/// Raw notification kind, before coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Removed,
    /// Rename with both source and destination in `paths`.
    Renamed,
    /// Source half of a rename the OS did not pair.
    RenamedFrom,
    /// Destination half of a rename the OS did not pair.
    RenamedTo,
    /// Access and other notifications that never reach subscribers.
    Ignored,
}

impl From<notify::EventKind> for RawKind {
    fn from(kind: notify::EventKind) -> Self {
        match kind {
            notify::EventKind::Create(_) => Self::Created,
            notify::EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::Both => Self::Renamed,
                RenameMode::To => Self::RenamedTo,
                _ => Self::RenamedFrom,
            },
            notify::EventKind::Modify(_) | notify::EventKind::Any => Self::Modified,
            notify::EventKind::Remove(_) => Self::Removed,
            notify::EventKind::Access(_) | notify::EventKind::Other => Self::Ignored,
        }
    }
}

/// A notification as delivered by a watch backend.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// A filesystem change.
    Change { kind: RawKind, paths: Vec<PathBuf> },

    /// A backend failure, possibly tied to specific paths.
    Error { message: String, paths: Vec<PathBuf> },
}

impl RawEvent {
    pub fn change(kind: RawKind, path: impl Into<PathBuf>) -> Self {
        Self::Change {
            kind,
            paths: vec![path.into()],
        }
    }

    pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self::Change {
            kind: RawKind::Renamed,
            paths: vec![from.into(), to.into()],
        }
    }

    /// Translate a change notification into change events.
    ///
    /// Errors and ignored kinds yield nothing.
    pub fn into_changes(self) -> Vec<ChangeEvent> {
        let (kind, paths) = match self {
            Self::Change { kind, paths } => (kind, paths),
            Self::Error { .. } => return Vec::new(),
        };

        match kind {
            RawKind::Ignored => Vec::new(),
            RawKind::Renamed if paths.len() >= 2 => {
                vec![ChangeEvent::renamed(paths[0].clone(), paths[1].clone())]
            }
            RawKind::Renamed | RawKind::RenamedFrom => paths
                .into_iter()
                .map(|p| ChangeEvent::new(ChangeKind::Renamed, p))
                .collect(),
            RawKind::RenamedTo | RawKind::Created => paths
                .into_iter()
                .map(|p| ChangeEvent::new(ChangeKind::Created, p))
                .collect(),
            RawKind::Modified => paths
                .into_iter()
                .map(|p| ChangeEvent::new(ChangeKind::Modified, p))
                .collect(),
            RawKind::Removed => paths
                .into_iter()
                .map(|p| ChangeEvent::new(ChangeKind::Removed, p))
                .collect(),
        }
    }
}

impl From<notify::Result<notify::Event>> for RawEvent {
    fn from(res: notify::Result<notify::Event>) -> Self {
        match res {
            Ok(event) => Self::Change {
                kind: RawKind::from(event.kind),
                paths: event.paths,
            },
            Err(e) => Self::Error {
                message: e.to_string(),
                paths: e.paths,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, RemoveKind};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    #[test]
    fn test_kinds_set() {
        let kinds: ChangeKinds = [ChangeKind::Modified, ChangeKind::Removed].into_iter().collect();
        assert!(kinds.contains(ChangeKind::Modified));
        assert!(kinds.contains(ChangeKind::Removed));
        assert!(!kinds.contains(ChangeKind::Created));
        assert_eq!(ChangeKinds::default(), ChangeKinds::all());
        assert!(ChangeKinds::none().is_empty());
    }

    #[test]
    fn test_kinds_serialize_as_list() {
        let kinds = ChangeKinds::from(ChangeKind::Modified).with(ChangeKind::Created);
        let json = serde_json::to_string(&kinds).unwrap();
        assert_eq!(json, r#"["created","modified"]"#);

        let back: ChangeKinds = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kinds);
    }

    #[test]
    fn test_raw_kind_mapping() {
        use notify::EventKind;

        assert_eq!(RawKind::from(EventKind::Create(CreateKind::File)), RawKind::Created);
        assert_eq!(
            RawKind::from(EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            RawKind::Modified
        );
        assert_eq!(
            RawKind::from(EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            RawKind::Renamed
        );
        assert_eq!(RawKind::from(EventKind::Remove(RemoveKind::File)), RawKind::Removed);
        assert_eq!(RawKind::from(EventKind::Access(AccessKind::Any)), RawKind::Ignored);
    }

    #[test]
    fn test_paired_rename_keeps_destination() {
        let events = RawEvent::rename("/a/old.txt", "/a/new.txt").into_changes();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Renamed);
        assert_eq!(events[0].path, Path::new("/a/old.txt"));
        assert_eq!(events[0].new_path.as_deref(), Some(Path::new("/a/new.txt")));
    }

    #[test]
    fn test_unpaired_rename_destination_is_created() {
        let events = RawEvent::change(RawKind::RenamedTo, "/a/new.txt").into_changes();
        assert_eq!(events[0].kind, ChangeKind::Created);
    }

    #[test]
    fn test_ignored_and_errors_yield_nothing() {
        assert!(RawEvent::change(RawKind::Ignored, "/a").into_changes().is_empty());
        let err = RawEvent::Error {
            message: "boom".to_string(),
            paths: vec![PathBuf::from("/a")],
        };
        assert!(err.into_changes().is_empty());
    }
}
