//! Staleguard configuration: TOML schema, loading and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;
use crate::controller::ControllerOptions;
use crate::heartbeat::HeartbeatConfig;
use crate::staleness::{ChallengerOptions, CheckerOptions, PhaseProtocol};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration.
///
/// Load with [`StaleguardConfig::load`], which searches:
/// 1. an explicit path (the `--config` flag)
/// 2. `$STALEGUARD_CONFIG`
/// 3. `./staleguard.toml`
/// 4. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaleguardConfig {
    /// Challenge/response protocol timing
    #[serde(default)]
    pub staleness: StalenessConfig,

    /// Backoff for failed syncs
    #[serde(default)]
    pub retry: RetryConfig,

    /// Process heartbeat
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    /// Embedded store location
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StaleguardConfig {
    /// Load configuration using the standard search order.
    ///
    /// An explicit path must load cleanly. A broken file found through the
    /// environment variable or the working directory is reported and skipped.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        // 1. Explicit path
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            info!(path = %path.display(), "Loaded config from --config");
            return Ok(config);
        }

        // 2. Env var
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", defaults::CONFIG_ENV_VAR);
                        return Ok(config);
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", defaults::CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", defaults::CONFIG_ENV_VAR);
            }
        }

        // 3. ./staleguard.toml
        let local = PathBuf::from(defaults::LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", defaults::LOCAL_CONFIG_FILE);
                    return Ok(config);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", defaults::LOCAL_CONFIG_FILE);
                }
            }
        }

        // 4. Defaults
        info!("No {} found, using built-in defaults", defaults::LOCAL_CONFIG_FILE);
        Ok(Self::default())
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate TOML text. Unknown keys are logged as warnings.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        // Two-pass: check for unknown keys first (warnings only)
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let s = &self.staleness;
        if s.challenge_interval_secs == 0 {
            errors.push("staleness.challenge_interval_secs must be > 0".to_string());
        }
        if s.response_grace_period_secs == 0 {
            errors.push("staleness.response_grace_period_secs must be > 0".to_string());
        }
        if s.resync_period_secs == 0 {
            errors.push("staleness.resync_period_secs must be > 0".to_string());
        }
        if s.workers == 0 {
            errors.push("staleness.workers must be > 0".to_string());
        }

        let r = &self.retry;
        if r.base_delay_ms == 0 {
            errors.push("retry.base_delay_ms must be > 0".to_string());
        }
        if r.base_delay() > r.max_delay() {
            errors.push(format!(
                "retry.base_delay_ms ({} ms) must be <= retry.max_delay_secs ({} s)",
                r.base_delay_ms, r.max_delay_secs
            ));
        }

        let h = &self.heartbeat;
        if h.enabled {
            if h.interval_secs == 0 {
                errors.push("heartbeat.interval_secs must be > 0".to_string());
            }
            if h.max_dead_secs <= h.interval_secs {
                errors.push(format!(
                    "heartbeat.max_dead_secs ({}) must be greater than heartbeat.interval_secs ({})",
                    h.max_dead_secs, h.interval_secs
                ));
            }
            if h.path.as_os_str().is_empty() {
                errors.push("heartbeat.path must not be empty".to_string());
            }
            if h.recovery_command.as_deref().is_some_and(|c| c.trim().is_empty()) {
                errors.push("heartbeat.recovery_command must not be blank when set".to_string());
            }
        }

        let st = &self.store;
        if st.path.as_os_str().is_empty() {
            errors.push("store.path must not be empty".to_string());
        }
        if st.max_events == 0 {
            errors.push("store.max_events must be > 0".to_string());
        }
        if st.inbox_dir.as_os_str().is_empty() {
            errors.push("store.inbox_dir must not be empty".to_string());
        }
        if st.inbox_poll_ms == 0 {
            errors.push("store.inbox_poll_ms must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn challenger_options(&self) -> ChallengerOptions {
        ChallengerOptions {
            challenge_interval: Duration::from_secs(self.staleness.challenge_interval_secs),
            protocol: self.staleness.protocol,
        }
    }

    pub fn checker_options(&self) -> CheckerOptions {
        CheckerOptions {
            response_grace_period: Duration::from_secs(self.staleness.response_grace_period_secs),
            protocol: self.staleness.protocol,
        }
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            workers: self.staleness.workers,
            resync_period: Duration::from_secs(self.staleness.resync_period_secs),
            retry_base_delay: self.retry.base_delay(),
            retry_max_delay: self.retry.max_delay(),
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error ({}): {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed:\n{}", format_errors(.0))]
    Validation(Vec<String>),
}

fn format_errors(errors: &[String]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Staleness
// ============================================================================

/// `[staleness]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    #[serde(default = "default_challenge_interval")]
    pub challenge_interval_secs: u64,

    #[serde(default = "default_response_grace_period")]
    pub response_grace_period_secs: u64,

    #[serde(default = "default_resync_period")]
    pub resync_period_secs: u64,

    /// Workers per controller
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// `dual-write` (marker plus sentinel text) or `structured` (marker only)
    #[serde(default)]
    pub protocol: PhaseProtocol,
}

fn default_challenge_interval() -> u64 { defaults::CHALLENGE_INTERVAL_SECS }
fn default_response_grace_period() -> u64 { defaults::RESPONSE_GRACE_PERIOD_SECS }
fn default_resync_period() -> u64 { defaults::RESYNC_PERIOD_SECS }
fn default_workers() -> usize { defaults::WORKERS }

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            challenge_interval_secs: default_challenge_interval(),
            response_grace_period_secs: default_response_grace_period(),
            resync_period_secs: default_resync_period(),
            workers: default_workers(),
            protocol: PhaseProtocol::default(),
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

/// `[retry]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max")]
    pub max_delay_secs: u64,
}

fn default_retry_base() -> u64 { defaults::RETRY_BASE_DELAY_MS }
fn default_retry_max() -> u64 { defaults::RETRY_MAX_DELAY_SECS }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base(),
            max_delay_secs: default_retry_max(),
        }
    }
}

impl RetryConfig {
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// `[heartbeat]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_path")]
    pub path: PathBuf,

    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_max_dead")]
    pub max_dead_secs: u64,

    /// Shell command run once after an outage longer than `max_dead_secs`
    #[serde(default)]
    pub recovery_command: Option<String>,
}

fn default_true() -> bool { true }
fn default_heartbeat_path() -> PathBuf { PathBuf::from(defaults::HEARTBEAT_PATH) }
fn default_heartbeat_interval() -> u64 { defaults::HEARTBEAT_INTERVAL_SECS }
fn default_max_dead() -> u64 { defaults::HEARTBEAT_MAX_DEAD_SECS }

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_heartbeat_path(),
            interval_secs: default_heartbeat_interval(),
            max_dead_secs: default_max_dead(),
            recovery_command: None,
        }
    }
}

impl HeartbeatSettings {
    pub fn to_heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            path: self.path.clone(),
            interval: Duration::from_secs(self.interval_secs),
            max_dead_duration: Duration::from_secs(self.max_dead_secs),
        }
    }
}

// ============================================================================
// Store / Logging
// ============================================================================

/// `[store]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Newest events kept in the persisted log
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Directory owners submit status records into while `run` holds the store
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,

    #[serde(default = "default_inbox_poll")]
    pub inbox_poll_ms: u64,
}

fn default_store_path() -> PathBuf { PathBuf::from(defaults::STORE_PATH) }
fn default_max_events() -> usize { defaults::MAX_EVENTS }
fn default_inbox_dir() -> PathBuf { PathBuf::from(defaults::INBOX_DIR) }
fn default_inbox_poll() -> u64 { defaults::INBOX_POLL_MS }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_events: default_max_events(),
            inbox_dir: default_inbox_dir(),
            inbox_poll_ms: default_inbox_poll(),
        }
    }
}

impl StoreConfig {
    pub const fn inbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.inbox_poll_ms)
    }
}

/// `[logging]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Tests
// ============================================================================
