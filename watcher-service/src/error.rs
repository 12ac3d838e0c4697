//! Error types for the watcher service.

use thiserror::Error;

use crate::registry::HandleId;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur in the watcher service.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// The path does not exist or cannot be accessed.
    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The operation requires a running service.
    #[error("watcher service is not running")]
    NotRunning,

    /// `start` was called on a service that is not stopped.
    #[error("watcher service is already running")]
    AlreadyRunning,

    /// `stop_all` was called on a stopped service.
    #[error("watcher service is already stopped")]
    AlreadyStopped,

    /// The handle was released earlier, explicitly or because its target vanished.
    #[error("watch handle {0} was already released")]
    AlreadyReleased(HandleId),

    /// Invalid exclude pattern.
    #[error("invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// Error from the OS notification backend.
    #[error("watch backend error: {0}")]
    Backend(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatcherError {
    pub(crate) fn invalid_path(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::InvalidPath {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is a state-precondition violation rather than a
    /// resource failure.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotRunning | Self::AlreadyRunning | Self::AlreadyStopped | Self::AlreadyReleased(_)
        )
    }
}
