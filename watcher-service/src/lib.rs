//! # Watcher Service
//!
//! Background file watching for a desktop app that keeps running in the tray.
//! The service watches registered paths, coalesces raw OS notifications and
//! delivers change events to listeners and to the renderer process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Watcher Service                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  WatchBackend ──► RawEvent ──► Debouncer ──► ChangeEvent        │
//! │       │                                          │              │
//! │       ▼                                          ▼              │
//! │  HandleRegistry                           Subscribers ──► IPC   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use traywatch_watcher::{ChangeKind, WatcherConfig, WatcherService};
//!
//! let service = WatcherService::new(WatcherConfig::default())?;
//! service.start().await?;
//!
//! let _sub = service.on_change(|event| {
//!     println!("{} {}", event.kind, event.path.display());
//!     Ok(())
//! });
//! let handle = service.watch("/tmp/x", ChangeKind::Modified).await?;
//! // ...
//! service.unwatch(&handle).await?;
//! service.stop_all().await?;
//! ```

pub mod backend;
pub mod config;
pub mod debounce;
pub mod error;
pub mod event;
pub mod registry;
pub mod renderer;
pub mod service;
pub mod subscriber;

pub use backend::{BackendFactory, ManualBackendFactory, NotifyBackendFactory, RawEventInjector};
pub use config::WatcherConfig;
pub use error::{Result, WatcherError};
pub use event::{ChangeEvent, ChangeKind, ChangeKinds, RawEvent, RawKind};
pub use registry::{HandleId, WatchHandle};
pub use renderer::{RendererMessage, forward_to_renderer};
pub use service::{ServiceState, StopReport, WatcherService, WatcherStats};
pub use subscriber::{Subscription, SubscriptionId};
