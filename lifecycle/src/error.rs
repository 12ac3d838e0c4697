//! Error types for the lifecycle coordinator.

use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors that can occur in the lifecycle coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Services can no longer be registered.
    #[error("coordinator is shutting down")]
    ShuttingDown,

    /// A host signal name was not recognized.
    #[error("unknown host signal: {0}")]
    UnknownSignal(String),
}
