//! System-wide default constants.
//!
//! Every tunable that `staleguard.toml` can override starts here.

// ============================================================================
// Config file discovery
// ============================================================================

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "STALEGUARD_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "staleguard.toml";

// ============================================================================
// Staleness protocol
// ============================================================================

/// Minimum spacing between challenge episodes (seconds).
pub const CHALLENGE_INTERVAL_SECS: u64 = 60;

/// Time an owner has to clear an open challenge (seconds).
pub const RESPONSE_GRACE_PERIOD_SECS: u64 = 60;

/// Full resync period of each controller (seconds).
///
/// Challenges and staleness are time-driven, so this bounds how late either
/// transition can fire after it becomes due.
pub const RESYNC_PERIOD_SECS: u64 = 10;

/// Parallel workers per controller.
pub const WORKERS: usize = 2;

// ============================================================================
// Retry
// ============================================================================

/// First retry delay after a failed sync (milliseconds).
pub const RETRY_BASE_DELAY_MS: u64 = 5;

/// Retry delay ceiling (seconds).
pub const RETRY_MAX_DELAY_SECS: u64 = 1_000;

// ============================================================================
// Heartbeat
// ============================================================================

/// Heartbeat file location.
pub const HEARTBEAT_PATH: &str = "./data/heartbeat";

/// Heartbeat refresh interval (seconds).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Longest tolerated heartbeat gap before recovery fires (seconds).
pub const HEARTBEAT_MAX_DEAD_SECS: u64 = 300;

// ============================================================================
// Storage
// ============================================================================

/// Embedded status store directory.
pub const STORE_PATH: &str = "./data/staleguard.db";

/// Retention cap of the persisted event log (events).
pub const MAX_EVENTS: usize = 10_000;

/// Directory owners drop status records into while the daemon holds the store.
pub const INBOX_DIR: &str = "./data/inbox";

/// How often the daemon ingests the inbox (milliseconds).
pub const INBOX_POLL_MS: u64 = 500;
