//! Watch backends: the seam between the service and the OS notification
//! mechanism.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::event::RawEvent;

/// Channel into the service's event pump. Sending never blocks.
pub type RawEventSender = mpsc::UnboundedSender<RawEvent>;

/// An OS-level watch mechanism.
pub trait WatchBackend: Send {
    /// Acquire a watch on `path`.
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<()>;

    /// Release the watch on `path`.
    fn unwatch(&mut self, path: &Path) -> Result<()>;
}

/// Creates a backend each time the service starts.
pub trait BackendFactory: Send + Sync {
    fn create(&self, events: RawEventSender) -> Result<Box<dyn WatchBackend>>;
}

/// Backend built on `notify`'s recommended watcher for the platform.
pub struct NotifyBackend {
    watcher: RecommendedWatcher,
}

impl WatchBackend for NotifyBackend {
    fn watch(&mut self, path: &Path, recursive: bool) -> Result<()> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher.watch(path, mode)?;
        debug!("Started watching: {}", path.display());
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watcher.unwatch(path)?;
        debug!("Stopped watching: {}", path.display());
        Ok(())
    }
}

/// Factory for [`NotifyBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyBackendFactory;

impl BackendFactory for NotifyBackendFactory {
    fn create(&self, events: RawEventSender) -> Result<Box<dyn WatchBackend>> {
        // Runs on notify's own thread: convert and hand off, nothing else.
        let watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if events.send(RawEvent::from(res)).is_err() {
                    debug!("Event pump gone, dropping notification");
                }
            },
        )?;

        Ok(Box::new(NotifyBackend { watcher }))
    }
}

#[derive(Default)]
struct ManualState {
    sender: Option<RawEventSender>,
    watched: HashSet<PathBuf>,
}

/// Backend whose notifications are pushed by the host through a
/// [`RawEventInjector`] instead of coming from the OS.
///
/// Useful for hosts that already receive change notifications from another
/// source, and for deterministic tests.
#[derive(Clone, Default)]
pub struct ManualBackendFactory {
    state: Arc<Mutex<ManualState>>,
}

impl ManualBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for pushing notifications into the running service.
    pub fn injector(&self) -> RawEventInjector {
        RawEventInjector {
            state: Arc::clone(&self.state),
        }
    }
}

impl BackendFactory for ManualBackendFactory {
    fn create(&self, events: RawEventSender) -> Result<Box<dyn WatchBackend>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sender = Some(events);
        state.watched.clear();

        Ok(Box::new(ManualBackend {
            state: Arc::clone(&self.state),
        }))
    }
}

struct ManualBackend {
    state: Arc<Mutex<ManualState>>,
}

impl WatchBackend for ManualBackend {
    fn watch(&mut self, path: &Path, _recursive: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.watched.insert(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.watched.remove(path);
        Ok(())
    }
}

impl Drop for ManualBackend {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sender = None;
        state.watched.clear();
    }
}

/// Pushes raw notifications into a service running on a
/// [`ManualBackendFactory`].
#[derive(Clone)]
pub struct RawEventInjector {
    state: Arc<Mutex<ManualState>>,
}

impl RawEventInjector {
    /// Deliver a notification. Returns false if no service is running.
    pub fn send(&self, event: RawEvent) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &state.sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Paths the service currently holds backend watches on.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut paths: Vec<PathBuf> = state.watched.iter().cloned().collect();
        paths.sort();
        paths
    }
}
