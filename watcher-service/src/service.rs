//! The watcher service.
//!
//! Mutating operations (`start`, `watch`, `unwatch`, `stop_all`, and the
//! auto-release of vanished targets) queue on one async mutex, so state
//! transitions never interleave. Raw notifications arrive on an unbounded
//! channel from the backend and are coalesced by the event pump. Ready events
//! go on a second queue, drained by the dispatcher that calls listeners.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendFactory, NotifyBackendFactory, WatchBackend};
use crate::config::{ExcludeSet, WatcherConfig};
use crate::debounce::Debouncer;
use crate::error::{Result, WatcherError};
use crate::event::{ChangeEvent, ChangeKind, ChangeKinds, RawEvent};
use crate::registry::{HandleId, HandleRegistry, WatchHandle, WatchTarget};
use crate::subscriber::{DeliveryStats, Dispatcher, Listener, Subscribers, Subscription};

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// What a `stop_all` released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopReport {
    /// Handles released.
    pub released_handles: usize,

    /// Coalesced events dropped before reaching listeners, whether still in
    /// their window or queued behind a listener call.
    pub discarded_events: usize,
}

/// Statistics about the watcher service.
#[derive(Debug, Clone)]
pub struct WatcherStats {
    pub state: ServiceState,

    /// Number of live handles.
    pub active_handles: usize,

    /// Number of distinct paths holding an OS watch.
    pub watched_paths: usize,

    /// Events waiting for their debounce window.
    pub pending_events: usize,

    /// Events handed to listeners since construction.
    pub delivered_events: u64,

    /// Listener calls that returned an error, panicked or overran the
    /// listener timeout.
    pub listener_failures: u64,

    /// Registered listeners.
    pub subscribers: usize,
}

/// Pump and dispatcher tasks, stopped together through one token.
struct EventPump {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    dispatch: JoinHandle<usize>,
}

/// What became of a target after its path was removed or renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Something is at the path again and the OS watch was re-acquired.
    Restored,
    /// The path is gone and every handle on it was released.
    Released,
    /// No handle targets the path any more.
    Untracked,
    /// The service is stopping.
    Stopping,
}

/// Resources that only exist between `start` and `stop_all`.
#[derive(Default)]
struct Runtime {
    backend: Option<Box<dyn WatchBackend>>,
    pump: Option<EventPump>,
}

struct Shared {
    config: WatcherConfig,
    excludes: ExcludeSet,
    factory: Box<dyn BackendFactory>,

    /// Operation queue. Holding it is the right to change state.
    ops: tokio::sync::Mutex<Runtime>,
    state: watch::Sender<ServiceState>,

    registry: RwLock<HandleRegistry>,
    debouncer: Mutex<Debouncer>,
    subscribers: Arc<Mutex<Subscribers>>,
    stats: Arc<DeliveryStats>,
    dispatcher: Arc<Dispatcher>,
}

/// Background service that watches filesystem targets and notifies listeners.
///
/// Cloning yields another handle to the same service. Construct one per
/// process at startup and pass it to whoever needs it.
#[derive(Clone)]
pub struct WatcherService {
    shared: Arc<Shared>,
}

impl WatcherService {
    /// Create a service backed by the platform's native watcher.
    pub fn new(config: WatcherConfig) -> Result<Self> {
        Self::with_backend(config, NotifyBackendFactory)
    }

    /// Create a service with a custom backend.
    pub fn with_backend(config: WatcherConfig, factory: impl BackendFactory + 'static) -> Result<Self> {
        let excludes = config.compile_excludes()?;
        let (state, _) = watch::channel(ServiceState::Stopped);
        let subscribers = Arc::new(Mutex::new(Subscribers::default()));
        let stats = Arc::new(DeliveryStats::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&subscribers),
            Arc::clone(&stats),
            config.listener_timeout(),
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                debouncer: Mutex::new(Debouncer::new(config.debounce())),
                config,
                excludes,
                factory: Box::new(factory),
                ops: tokio::sync::Mutex::new(Runtime::default()),
                state,
                registry: RwLock::new(HandleRegistry::new()),
                subscribers,
                stats,
                dispatcher,
            }),
        })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.shared.config
    }

    /// Current state. Never blocks and has no side effects.
    pub fn status(&self) -> ServiceState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ServiceState> {
        self.shared.state.subscribe()
    }

    /// Start listening for OS notifications.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.shared.ops.lock().await;
        if self.status() != ServiceState::Stopped {
            return Err(WatcherError::AlreadyRunning);
        }

        self.shared.set_state(ServiceState::Starting);

        let (tx, rx) = mpsc::unbounded_channel();
        let backend = match self.shared.factory.create(tx) {
            Ok(backend) => backend,
            Err(e) => {
                self.shared.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let dispatch = tokio::spawn(
            Arc::clone(&self.shared.dispatcher).run(ready_rx, cancel.clone()),
        );
        let pump = tokio::spawn(run_pump(
            Arc::downgrade(&self.shared),
            rx,
            ready_tx,
            cancel.clone(),
        ));

        runtime.backend = Some(backend);
        runtime.pump = Some(EventPump {
            cancel,
            pump,
            dispatch,
        });

        self.shared.set_state(ServiceState::Running);
        info!("Watcher service started");
        Ok(())
    }

    /// Register interest in `path`.
    pub async fn watch(
        &self,
        path: impl AsRef<Path>,
        kinds: impl Into<ChangeKinds>,
    ) -> Result<WatchHandle> {
        let path = path.as_ref();
        let kinds = kinds.into();

        let mut runtime = self.shared.ops.lock().await;
        if self.status() != ServiceState::Running {
            return Err(WatcherError::NotRunning);
        }

        let (normalized, is_dir) = normalize(path).await?;
        let recursive = is_dir && self.shared.config.recursive;
        let target = WatchTarget::new(normalized.clone(), kinds, recursive);

        let mut registry = self.shared.registry.write().await;
        let (handle, first) = registry.insert(target);

        if first {
            if let Some(backend) = runtime.backend.as_mut() {
                if let Err(e) = backend.watch(&normalized, recursive) {
                    let _ = registry.release(handle.id());
                    return Err(classify_backend_error(&normalized, e));
                }
            }
        }

        debug!(
            "Watching {} as {} ({kinds:?})",
            normalized.display(),
            handle.id()
        );
        Ok(handle)
    }

    /// Release a handle.
    ///
    /// Fails with [`WatcherError::AlreadyReleased`] if the handle was released
    /// before, including by the service itself when its target vanished.
    pub async fn unwatch(&self, handle: &WatchHandle) -> Result<()> {
        let mut runtime = self.shared.ops.lock().await;

        let released = self.shared.registry.write().await.release(handle.id())?;
        let path = released.target.path();

        if released.last_for_path {
            self.shared.lock_debouncer().cancel(path);
            if let Some(backend) = runtime.backend.as_mut() {
                if let Err(e) = backend.unwatch(path) {
                    debug!("Backend unwatch of {} failed: {e}", path.display());
                }
            }
        }

        debug!("Released {} for {}", handle.id(), path.display());
        Ok(())
    }

    /// Register a listener.
    ///
    /// Listeners are called one at a time, in registration order, on the
    /// blocking pool. A call that takes longer than the listener timeout is
    /// counted as a failure and the next listener is called without waiting.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: Arc<Listener> = Arc::new(listener);
        Subscribers::subscribe(&self.shared.subscribers, listener)
    }

    /// Stop watching everything.
    ///
    /// Releases every handle, drops events not yet delivered and waits for
    /// listener calls already in progress before resolving.
    pub async fn stop_all(&self) -> Result<StopReport> {
        let mut runtime = self.shared.ops.lock().await;
        if self.status() == ServiceState::Stopped {
            return Err(WatcherError::AlreadyStopped);
        }

        self.shared.set_state(ServiceState::Stopping);
        info!("Stopping watcher service");

        let mut undelivered = 0;
        if let Some(pump) = runtime.pump.take() {
            pump.cancel.cancel();
            if let Err(e) = pump.pump.await {
                warn!("Event pump ended abnormally: {e}");
            }
            match pump.dispatch.await {
                Ok(count) => undelivered = count,
                Err(e) => warn!("Dispatcher ended abnormally: {e}"),
            }
        }

        let (released_handles, paths) = self.shared.registry.write().await.drain();
        if let Some(mut backend) = runtime.backend.take() {
            for path in &paths {
                if let Err(e) = backend.unwatch(path) {
                    debug!("Backend unwatch of {} failed: {e}", path.display());
                }
            }
        }

        let discarded_events = self.shared.lock_debouncer().clear() + undelivered;

        self.shared.dispatcher.wait_idle().await;

        self.shared.set_state(ServiceState::Stopped);
        info!(
            "Watcher service stopped (released {released_handles} handles, discarded {discarded_events} events)"
        );

        Ok(StopReport {
            released_handles,
            discarded_events,
        })
    }

    /// Ids of live handles, in registration order.
    pub async fn active_handles(&self) -> Vec<HandleId> {
        self.shared.registry.read().await.active_ids()
    }

    /// Whether `handle` is still live.
    pub async fn is_active(&self, handle: &WatchHandle) -> bool {
        self.shared.registry.read().await.contains(handle.id())
    }

    /// Get statistics about the service.
    pub async fn stats(&self) -> WatcherStats {
        let registry = self.shared.registry.read().await;

        WatcherStats {
            state: self.status(),
            active_handles: registry.len(),
            watched_paths: registry.path_count(),
            pending_events: self.shared.lock_debouncer().len(),
            delivered_events: self.shared.stats.delivered(),
            listener_failures: self.shared.stats.failures(),
            subscribers: self
                .shared
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

impl fmt::Debug for WatcherService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherService")
            .field("state", &self.status())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Shared {
    fn set_state(&self, state: ServiceState) {
        let previous = self.state.send_replace(state);
        debug!("Watcher state {previous} -> {state}");
    }

    fn lock_debouncer(&self) -> std::sync::MutexGuard<'_, Debouncer> {
        self.debouncer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock_debouncer().next_deadline()
    }

    /// Feed a raw notification into the debouncer.
    fn ingest(&self, raw: RawEvent) {
        let changes = match raw {
            RawEvent::Error { message, paths } => {
                warn!("Watch backend error: {message}");
                // A watch that fails because its path is gone reports as a removal.
                paths
                    .into_iter()
                    .filter(|p| !p.exists())
                    .map(|p| ChangeEvent::new(ChangeKind::Removed, p))
                    .collect()
            }
            change => change.into_changes(),
        };

        let now = Instant::now();
        let mut debouncer = self.lock_debouncer();
        for change in changes {
            if self.excludes.matches(&change.path) {
                continue;
            }
            debouncer.push(change, now);
        }
    }

    /// Queue every event whose window has elapsed for the dispatcher.
    async fn flush_ready(
        &self,
        ready_tx: &mpsc::UnboundedSender<ChangeEvent>,
        cancel: &CancellationToken,
    ) {
        let ready = self.lock_debouncer().take_ready(Instant::now());

        for mut event in ready {
            let mut released = false;
            if matches!(event.kind, ChangeKind::Removed | ChangeKind::Renamed)
                && self.registry.read().await.is_target(&event.path)
            {
                match self.recover_target(&event.path, cancel).await {
                    Recovery::Stopping => return,
                    // Replaced in place, e.g. an editor's write-then-rename save.
                    Recovery::Restored if event.kind == ChangeKind::Removed => {
                        event.kind = ChangeKind::Modified;
                    }
                    Recovery::Released => released = true,
                    Recovery::Restored | Recovery::Untracked => {}
                }
            }

            // Losing a target is reported whatever kinds its handles asked for.
            let wanted =
                released || self.registry.read().await.is_interested(&event.path, event.kind);
            if wanted && ready_tx.send(event).is_err() {
                debug!("Dispatcher gone, dropping ready events");
                return;
            }
        }
    }

    /// Re-acquire the OS watch on a target whose path was removed or renamed,
    /// or release every handle on it if nothing is there any more.
    async fn recover_target(&self, path: &Path, cancel: &CancellationToken) -> Recovery {
        let mut runtime = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Recovery::Stopping,
            runtime = self.ops.lock() => runtime,
        };

        let Some(recursive) = self.registry.read().await.recursive_for(path) else {
            return Recovery::Untracked;
        };

        if path.exists() {
            if let Some(backend) = runtime.backend.as_mut() {
                // The old watch may already be gone with the old inode.
                let _ = backend.unwatch(path);
                match backend.watch(path, recursive) {
                    Ok(()) => {
                        info!("Target {} was replaced, watch re-acquired", path.display());
                        return Recovery::Restored;
                    }
                    Err(e) => debug!("Re-watching {} failed: {e}", path.display()),
                }
            }
        }

        let released = self.registry.write().await.release_path(path);
        self.lock_debouncer().cancel(path);
        if let Some(backend) = runtime.backend.as_mut() {
            if let Err(e) = backend.unwatch(path) {
                debug!("Backend unwatch of {} failed: {e}", path.display());
            }
        }

        info!(
            "Target {} vanished, released {} handle(s)",
            path.display(),
            released.len()
        );
        Recovery::Released
    }
}

async fn run_pump(
    shared: Weak<Shared>,
    mut rx: mpsc::UnboundedReceiver<RawEvent>,
    ready_tx: mpsc::UnboundedSender<ChangeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let Some(deadline) = shared.upgrade().map(|s| s.next_deadline()) else {
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            // Ahead of new notifications, so a steady stream cannot starve flushes.
            _ = sleep_until(deadline) => {
                let Some(shared) = shared.upgrade() else { break };
                shared.flush_ready(&ready_tx, &cancel).await;
            }
            raw = rx.recv() => {
                let Some(raw) = raw else { break };
                let Some(shared) = shared.upgrade() else { break };
                shared.ingest(raw);
            }
        }
    }

    debug!("Event pump stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolve `path` to an absolute, symlink-free form and check it is reachable.
async fn normalize(path: &Path) -> Result<(PathBuf, bool)> {
    let owned = path.to_path_buf();
    let resolved = tokio::task::spawn_blocking(move || {
        let canonical = dunce::canonicalize(&owned)?;
        let metadata = std::fs::metadata(&canonical)?;
        Ok::<_, std::io::Error>((canonical, metadata.is_dir()))
    })
    .await;

    match resolved {
        Ok(Ok(resolved)) => Ok(resolved),
        Ok(Err(e)) => Err(WatcherError::invalid_path(path, e)),
        Err(e) => Err(WatcherError::invalid_path(path, e)),
    }
}

fn classify_backend_error(path: &Path, error: WatcherError) -> WatcherError {
    match error {
        WatcherError::Backend(e) => match &e.kind {
            notify::ErrorKind::PathNotFound => WatcherError::invalid_path(path, "path not found"),
            notify::ErrorKind::Io(io)
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                WatcherError::invalid_path(path, io)
            }
            _ => WatcherError::Backend(e),
        },
        other => other,
    }
}
