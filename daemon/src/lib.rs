//! Headless sidecar for tray-mode hosts.
//!
//! ```text
//!   host stdin ──lines──► signal reader ──► LifecycleCoordinator
//!   Ctrl-C ─────────────────────┘                 │ before-quit
//!                                                 ▼
//!   WatcherService ──► forward_to_renderer ──► stdout (JSON lines)
//! ```
//!
//! The host writes `window-all-closed` or `before-quit`, one per line. Every
//! change event is written back as one JSON object per line. Closing stdin
//! counts as a quit.

pub mod cli;
pub mod config;

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use traywatch_lifecycle::{HostSignal, LifecycleCoordinator, ShutdownReport, SignalOutcome};
use traywatch_watcher::{RendererMessage, WatcherService, forward_to_renderer};

pub use cli::Args;
pub use config::{AppConfig, ConfigError, WatchEntry};

const SIGNAL_BUFFER: usize = 16;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run against the process's stdin/stdout until the host quits.
pub async fn run(config: AppConfig) -> anyhow::Result<ShutdownReport> {
    let watcher = WatcherService::new(config.watcher.clone())?;

    let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
    spawn_signal_reader(BufReader::new(tokio::io::stdin()), signals_tx.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, quitting");
            let _ = signals_tx.send(HostSignal::BeforeQuit).await;
        }
    });

    serve(watcher, &config, signals_rx, tokio::io::stdout()).await
}

/// Start `watcher`, establish the configured watches and follow `signals`.
///
/// Returns once a quit completed. Renderer messages are written to `output`.
pub async fn serve<W>(
    watcher: WatcherService,
    config: &AppConfig,
    signals: mpsc::Receiver<HostSignal>,
    output: W,
) -> anyhow::Result<ShutdownReport>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    watcher.start().await?;

    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    let forwarding = forward_to_renderer(&watcher, messages_tx);
    let writer = spawn_message_writer(messages_rx, output);

    for entry in &config.watch {
        match watcher.watch(&entry.path, entry.kinds).await {
            Ok(handle) => info!("Watching {} as {}", entry.path.display(), handle.id()),
            // A missing target should not keep the rest from being watched.
            Err(e) => warn!("Skipping {}: {e}", entry.path.display()),
        }
    }

    let coordinator = LifecycleCoordinator::new(config.lifecycle.clone());
    coordinator.register(watcher)?;

    let report = match coordinator.run(signals).await {
        Some(report) => report,
        None => match coordinator.handle(HostSignal::BeforeQuit).await {
            SignalOutcome::Quit(report) => report,
            _ => ShutdownReport::default(),
        },
    };

    forwarding.unsubscribe();
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("Renderer output did not drain before exit");
    }
    Ok(report)
}

/// Parse host signals from `input`, one per line.
///
/// Unknown lines are logged and skipped. End of input is sent as a quit.
pub fn spawn_signal_reader<R>(input: R, signals: mpsc::Sender<HostSignal>) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = input.lines();
        loop {
            let signal = match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<HostSignal>() {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!("{e}");
                        continue;
                    }
                },
                Ok(None) => {
                    info!("Host closed stdin, quitting");
                    HostSignal::BeforeQuit
                }
                Err(e) => {
                    warn!("Failed to read host signal: {e}");
                    HostSignal::BeforeQuit
                }
            };

            let quit = signal == HostSignal::BeforeQuit;
            if signals.send(signal).await.is_err() || quit {
                break;
            }
        }
    })
}

fn spawn_message_writer<W>(
    mut messages: mpsc::UnboundedReceiver<RendererMessage>,
    mut output: W,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode renderer message: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = write_line(&mut output, &line).await {
                warn!("Renderer output closed: {e}");
                break;
            }
        }
    })
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &[u8]) -> std::io::Result<()> {
    output.write_all(line).await?;
    output.flush().await
}
