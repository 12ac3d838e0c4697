//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// CLI arguments for traywatch-daemon.
#[derive(Parser, Debug)]
#[clap(name = "traywatch-daemon")]
#[clap(
    about = "Watch paths in the background and follow host lifecycle signals on stdin",
    long_about = None
)]
pub struct Args {
    /// TOML configuration file
    #[clap(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Additional path to watch for every change kind (repeatable)
    #[clap(short, long = "watch", value_name = "PATH")]
    pub watch: Vec<PathBuf>,

    /// Override the debounce window in milliseconds
    #[clap(long, value_name = "MS")]
    pub debounce_ms: Option<u64>,

    /// Override how long quit waits for services, in milliseconds
    #[clap(long, value_name = "MS")]
    pub shutdown_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_repeated_watch_flags() {
        let args = Args::parse_from(["traywatch-daemon", "-w", "/a", "--watch", "/b"]);
        assert_eq!(args.watch, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(args.config.is_none());
        assert!(args.debounce_ms.is_none());
    }
}
