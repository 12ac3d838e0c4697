use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use traywatch_daemon::{AppConfig, Args};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries renderer messages, so logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = AppConfig::from_args(&args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(traywatch_daemon::run(config))?;
    // A pending stdin read would otherwise hold the runtime open forever.
    runtime.shutdown_timeout(Duration::from_millis(100));

    if !report.is_clean() {
        tracing::warn!(
            "Exited with {} failed and {} timed out services",
            report.failed.len(),
            report.timed_out.len()
        );
    }
    Ok(())
}
