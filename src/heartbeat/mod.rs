//! Process heartbeat watchdog
//!
//! Persists a timestamp to a local file on a timer. At startup the previous
//! timestamp is compared with the current time; if the process was down for
//! longer than tolerated, a recovery callback runs once in the background.
//!
//! The heartbeat never touches status records.

pub mod recovery;
pub mod watchdog;

pub use recovery::{CommandRecovery, FnRecovery, LogOnlyRecovery, RecoveryCallback};
pub use watchdog::HeartbeatWatchdog;

use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use thiserror::Error;

/// Heartbeat file location and timing
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub path: PathBuf,
    /// Time between refreshes of the heartbeat file
    pub interval: Duration,
    /// Longest tolerated gap before the recovery callback fires
    pub max_dead_duration: Duration,
}

/// Heartbeat failures. All of these are fatal to the process.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("Failed to read heartbeat file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Heartbeat file {} holds an unparseable timestamp {value:?}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("Failed to write heartbeat file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of comparing the stored heartbeat with the current time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupCheck {
    /// No heartbeat file yet
    FirstRun,
    /// Previous heartbeat within the tolerated gap
    Alive { gap: TimeDelta },
    /// Previous heartbeat older than tolerated; recovery is due
    Resurrected { gap: TimeDelta },
}

impl StartupCheck {
    pub const fn needs_recovery(&self) -> bool {
        matches!(self, Self::Resurrected { .. })
    }
}
