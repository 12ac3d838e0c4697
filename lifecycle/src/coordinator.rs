//! Lifecycle coordinator.
//!
//! Binds background services to the host's lifecycle:
//!
//! ```text
//!   window-all-closed ──► KeepRunning (services untouched)
//!
//!   before-quit ──► ShuttingDown ──► shutdown() on every service ──► Terminated
//!                                    (concurrent, one shared deadline)
//!
//!   before-quit (again) ──► AlreadyShuttingDown { terminated }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LifecycleConfig;
use crate::error::{CoordinatorError, Result};
use crate::service::BackgroundService;
use crate::signal::{HostSignal, SignalOutcome};

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    NotRegistered,
    Registered,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotRegistered => "not_registered",
            Self::Registered => "registered",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Outcome of a quit-triggered shutdown, by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Services that stopped cleanly.
    pub completed: Vec<String>,
    /// Services whose shutdown returned an error or panicked.
    pub failed: Vec<(String, String)>,
    /// Services still stopping when the deadline passed.
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    /// Whether quit proceeded because the shutdown deadline elapsed.
    pub fn deadline_elapsed(&self) -> bool {
        !self.timed_out.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

struct Inner {
    services: Vec<Arc<dyn BackgroundService>>,
}

/// Routes host lifecycle signals to registered background services.
pub struct LifecycleCoordinator {
    config: LifecycleConfig,
    inner: Mutex<Inner>,
    state: watch::Sender<CoordinatorState>,
}

impl LifecycleCoordinator {
    pub fn new(config: LifecycleConfig) -> Self {
        let (state, _) = watch::channel(CoordinatorState::NotRegistered);
        Self {
            config,
            inner: Mutex::new(Inner {
                services: Vec::new(),
            }),
            state,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn state_changes(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Register a service to be stopped on quit.
    pub fn register(&self, service: impl BackgroundService) -> Result<()> {
        self.register_shared(Arc::new(service))
    }

    pub fn register_shared(&self, service: Arc<dyn BackgroundService>) -> Result<()> {
        let mut inner = self.lock_inner();
        match self.state() {
            CoordinatorState::ShuttingDown | CoordinatorState::Terminated => {
                return Err(CoordinatorError::ShuttingDown);
            }
            CoordinatorState::NotRegistered => self.set_state(CoordinatorState::Registered),
            CoordinatorState::Registered => {}
        }
        debug!("Registered background service {}", service.name());
        inner.services.push(service);
        Ok(())
    }

    /// Number of registered services.
    pub fn service_count(&self) -> usize {
        self.lock_inner().services.len()
    }

    /// Handle one host signal.
    pub async fn handle(&self, signal: HostSignal) -> SignalOutcome {
        match signal {
            HostSignal::WindowAllClosed => {
                debug!("All windows closed, background services keep running");
                SignalOutcome::KeepRunning
            }
            HostSignal::BeforeQuit => match self.begin_shutdown() {
                Ok(services) => {
                    let report = self.shut_down(services).await;
                    self.set_state(CoordinatorState::Terminated);
                    info!(
                        "Shutdown finished: {} completed, {} failed, {} timed out",
                        report.completed.len(),
                        report.failed.len(),
                        report.timed_out.len()
                    );
                    SignalOutcome::Quit(report)
                }
                Err(terminated) => {
                    debug!("Quit already under way, ignoring repeated before-quit");
                    SignalOutcome::AlreadyShuttingDown { terminated }
                }
            },
        }
    }

    /// Process signals until one of them completes a quit.
    ///
    /// Returns `None` if the channel closes first.
    pub async fn run(&self, mut signals: mpsc::Receiver<HostSignal>) -> Option<ShutdownReport> {
        while let Some(signal) = signals.recv().await {
            debug!("Host signal: {signal}");
            if let SignalOutcome::Quit(report) = self.handle(signal).await {
                return Some(report);
            }
        }
        None
    }

    /// Flip to `ShuttingDown` exactly once and hand out the services.
    ///
    /// Fails with whether the earlier quit has already terminated.
    fn begin_shutdown(&self) -> std::result::Result<Vec<Arc<dyn BackgroundService>>, bool> {
        let inner = self.lock_inner();
        match self.state() {
            CoordinatorState::ShuttingDown => Err(false),
            CoordinatorState::Terminated => Err(true),
            CoordinatorState::NotRegistered | CoordinatorState::Registered => {
                self.set_state(CoordinatorState::ShuttingDown);
                Ok(inner.services.clone())
            }
        }
    }

    async fn shut_down(&self, services: Vec<Arc<dyn BackgroundService>>) -> ShutdownReport {
        let timeout = self.config.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        info!("Shutting down {} background services", services.len());

        // Spawned so a service that misses the deadline keeps stopping after quit.
        let tasks: Vec<_> = services
            .into_iter()
            .map(|service| {
                let name = service.name().to_string();
                let task = tokio::spawn(async move { service.shutdown().await });
                (name, task)
            })
            .collect();

        let mut report = ShutdownReport::default();
        for (name, task) in tasks {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(Ok(()))) => {
                    debug!("Service {name} stopped");
                    report.completed.push(name);
                }
                Ok(Ok(Err(e))) => {
                    error!("Service {name} failed to stop: {e:#}");
                    report.failed.push((name, format!("{e:#}")));
                }
                Ok(Err(join_error)) => {
                    error!("Service {name} shutdown task failed: {join_error}");
                    report.failed.push((name, join_error.to_string()));
                }
                Err(_) => {
                    warn!("Service {name} shutdown timed out after {timeout:?}, quitting anyway");
                    report.timed_out.push(name);
                }
            }
        }
        report
    }

    fn set_state(&self, next: CoordinatorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Coordinator state {prev} -> {next}");
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("state", &self.state())
            .field("services", &self.service_count())
            .field("config", &self.config)
            .finish()
    }
}
