//! Configuration for the watcher service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Default coalescing window.
pub const DEFAULT_DEBOUNCE_MS: u64 = 200;

/// Default time a listener call may take before delivery moves on.
pub const DEFAULT_LISTENER_TIMEOUT_MS: u64 = 1_000;

/// Configuration for a [`crate::WatcherService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Window in which raw notifications for one path are coalesced.
    pub debounce_ms: u64,

    /// Whether directory targets are watched recursively.
    pub recursive: bool,

    /// Patterns to exclude (glob patterns).
    pub exclude_patterns: Vec<String>,

    /// How long one listener call may block the next listener.
    pub listener_timeout_ms: u64,
}

impl WatcherConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            recursive: true,
            exclude_patterns: Self::default_excludes(),
            listener_timeout_ms: DEFAULT_LISTENER_TIMEOUT_MS,
        }
    }

    /// Set the debounce window.
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }

    /// Set how long a listener call may hold up delivery to later listeners.
    ///
    /// A call that overruns keeps running; `stop_all` still waits for it.
    pub fn with_listener_timeout(mut self, timeout: Duration) -> Self {
        self.listener_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Watch directory targets non-recursively.
    pub fn non_recursive(mut self) -> Self {
        self.recursive = false;
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Drop every exclude pattern, including the defaults.
    pub fn without_excludes(mut self) -> Self {
        self.exclude_patterns.clear();
        self
    }

    /// The debounce window as a duration.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    /// Editor swap files and OS metadata churn that should never reach the UI.
    fn default_excludes() -> Vec<String> {
        vec![
            "**/.git/**".to_string(),
            "**/*.swp".to_string(),
            "**/*~".to_string(),
            "**/.DS_Store".to_string(),
            "**/Thumbs.db".to_string(),
        ]
    }

    /// Compile the exclude patterns, failing on the first invalid one.
    pub fn compile_excludes(&self) -> Result<ExcludeSet> {
        let patterns = self
            .exclude_patterns
            .iter()
            .map(|p| glob::Pattern::new(p).map_err(|e| WatcherError::InvalidPattern(format!("{p}: {e}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(ExcludeSet { patterns })
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiled exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<glob::Pattern>,
}

impl ExcludeSet {
    /// Check if a path should be excluded.
    pub fn matches(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.patterns.iter().any(|p| p.matches(&path_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_builder() {
        let config = WatcherConfig::new()
            .with_debounce(Duration::from_millis(150))
            .non_recursive()
            .exclude("**/*.log");

        assert_eq!(config.debounce(), Duration::from_millis(150));
        assert!(!config.recursive);
        assert!(config.exclude_patterns.contains(&"**/*.log".to_string()));
    }

    #[test]
    fn test_exclude_patterns() {
        let excludes = WatcherConfig::new().compile_excludes().unwrap();

        assert!(excludes.matches(Path::new("/project/.git/index")));
        assert!(excludes.matches(Path::new("/project/notes.md.swp")));
        assert!(!excludes.matches(Path::new("/project/notes.md")));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = WatcherConfig::new().exclude("[unclosed");
        let err = config.compile_excludes().unwrap_err();
        assert!(matches!(err, WatcherError::InvalidPattern(_)));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: WatcherConfig = serde_json::from_str(r#"{"debounce_ms": 50}"#).unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert!(config.recursive);
        assert!(!config.exclude_patterns.is_empty());
        assert_eq!(config.listener_timeout(), Duration::from_millis(DEFAULT_LISTENER_TIMEOUT_MS));
    }
}
