//! Lifecycle coordination for tray-mode applications.
//!
//! A tray app keeps its background services alive after the last window
//! closes and stops them, bounded by a timeout, when the user actually quits.
//!
//! # Example
//!
//! ```rust,ignore
//! use traywatch_lifecycle::{HostSignal, LifecycleConfig, LifecycleCoordinator, SignalOutcome};
//! use traywatch_watcher::{WatcherConfig, WatcherService};
//!
//! let watcher = WatcherService::new(WatcherConfig::default())?;
//! watcher.start().await?;
//!
//! let coordinator = LifecycleCoordinator::new(LifecycleConfig::default());
//! coordinator.register(watcher.clone())?;
//!
//! // Closing windows never stops the watcher.
//! assert!(coordinator.handle(HostSignal::WindowAllClosed).await.prevents_default());
//!
//! if let SignalOutcome::Quit(report) = coordinator.handle(HostSignal::BeforeQuit).await {
//!     println!("stopped: {:?}", report.completed);
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod service;
pub mod signal;

pub use config::LifecycleConfig;
pub use coordinator::{CoordinatorState, LifecycleCoordinator, ShutdownReport};
pub use error::{CoordinatorError, Result};
pub use service::BackgroundService;
pub use signal::{HostSignal, SignalOutcome};
