//! Configuration for the lifecycle coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on how long quit waits for services.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Configuration for a [`crate::LifecycleCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long `before-quit` waits for every service to shut down.
    pub shutdown_timeout_ms: u64,
}

impl LifecycleConfig {
    pub fn new() -> Self {
        Self {
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::new()
    }
}
