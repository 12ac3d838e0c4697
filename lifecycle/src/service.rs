//! Background services the coordinator can shut down.

use async_trait::async_trait;
use tracing::debug;
use traywatch_watcher::{WatcherError, WatcherService};

/// A process-wide service that must release its resources before exit.
#[async_trait]
pub trait BackgroundService: Send + Sync + 'static {
    /// Service name for logging.
    fn name(&self) -> &str;

    /// Stop the service gracefully.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl BackgroundService for WatcherService {
    fn name(&self) -> &str {
        "watcher"
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        match self.stop_all().await {
            Ok(report) => {
                debug!(
                    "Watcher released {} handles, discarded {} events",
                    report.released_handles, report.discarded_events
                );
                Ok(())
            }
            Err(WatcherError::AlreadyStopped) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
