//! Daemon configuration file.
//!
//! ```toml
//! [watcher]
//! debounce_ms = 150
//! listener_timeout_ms = 500
//! exclude_patterns = [".git", "*.tmp"]
//!
//! [lifecycle]
//! shutdown_timeout_ms = 3000
//!
//! [[watch]]
//! path = "/home/me/notes"
//! kinds = ["created", "modified"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use traywatch_lifecycle::LifecycleConfig;
use traywatch_watcher::{ChangeKinds, WatcherConfig};

use crate::cli::Args;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A path to watch at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub path: PathBuf,

    #[serde(default)]
    pub kinds: ChangeKinds,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub watcher: WatcherConfig,
    pub lifecycle: LifecycleConfig,
    pub watch: Vec<WatchEntry>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Build the effective config from the file (if any) and command-line flags.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        Ok(config)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(ms) = args.debounce_ms {
            self.watcher.debounce_ms = ms;
        }
        if let Some(ms) = args.shutdown_timeout_ms {
            self.lifecycle.shutdown_timeout_ms = ms;
        }
        self.watch.extend(args.watch.iter().map(|path| WatchEntry {
            path: path.clone(),
            kinds: ChangeKinds::all(),
        }));
    }
}
