//! Host application lifecycle signals.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::coordinator::ShutdownReport;
use crate::error::CoordinatorError;

/// A lifecycle signal emitted by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostSignal {
    /// The last window closed. The app keeps running in the tray.
    WindowAllClosed,

    /// The app is about to quit.
    BeforeQuit,
}

impl HostSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WindowAllClosed => "window-all-closed",
            Self::BeforeQuit => "before-quit",
        }
    }
}

impl fmt::Display for HostSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostSignal {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "window-all-closed" => Ok(Self::WindowAllClosed),
            "before-quit" => Ok(Self::BeforeQuit),
            other => Err(CoordinatorError::UnknownSignal(other.to_string())),
        }
    }
}

/// What the host should do after a signal was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// Suppress the host's default action and keep the process alive.
    KeepRunning,

    /// Shutdown finished (or timed out); the host may exit.
    Quit(ShutdownReport),

    /// A quit is already in progress or done; nothing was invoked.
    ///
    /// While `terminated` is false the first quit is still waiting on its
    /// services, and the host must not exit on this signal.
    AlreadyShuttingDown { terminated: bool },
}

impl SignalOutcome {
    /// Whether the host must suppress its default behavior for the signal.
    pub fn prevents_default(&self) -> bool {
        matches!(
            self,
            Self::KeepRunning | Self::AlreadyShuttingDown { terminated: false }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_signals() {
        assert_eq!("before-quit".parse::<HostSignal>().unwrap(), HostSignal::BeforeQuit);
        assert_eq!(
            " window-all-closed\n".parse::<HostSignal>().unwrap(),
            HostSignal::WindowAllClosed
        );
        assert!(matches!(
            "will-quit".parse::<HostSignal>(),
            Err(CoordinatorError::UnknownSignal(name)) if name == "will-quit"
        ));
    }

    #[test]
    fn test_quit_in_progress_holds_the_host() {
        assert!(SignalOutcome::KeepRunning.prevents_default());
        assert!(SignalOutcome::AlreadyShuttingDown { terminated: false }.prevents_default());
        assert!(!SignalOutcome::AlreadyShuttingDown { terminated: true }.prevents_default());
        assert!(!SignalOutcome::Quit(ShutdownReport::default()).prevents_default());
    }

    #[test]
    fn test_signal_wire_names() {
        for signal in [HostSignal::WindowAllClosed, HostSignal::BeforeQuit] {
            let json = serde_json::to_string(&signal).unwrap();
            assert_eq!(json, format!("\"{signal}\""));
        }
    }
}
