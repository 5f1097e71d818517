//! Heartbeat file refresh loop and startup outage check

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HeartbeatConfig, HeartbeatError, RecoveryCallback, StartupCheck};
use crate::clock::{to_time_delta, Clock};

/// Keeps the heartbeat file fresh and fires recovery after an outage
pub struct HeartbeatWatchdog {
    config: HeartbeatConfig,
    clock: Arc<dyn Clock>,
    recovery: Arc<dyn RecoveryCallback>,
}

impl HeartbeatWatchdog {
    pub fn new(
        config: HeartbeatConfig,
        clock: Arc<dyn Clock>,
        recovery: Arc<dyn RecoveryCallback>,
    ) -> Self {
        Self {
            config,
            clock,
            recovery,
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Read the stored heartbeat, if any
    pub async fn read_heartbeat(&self) -> Result<Option<DateTime<Utc>>, HeartbeatError> {
        let path = &self.config.path;
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HeartbeatError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };

        let value = raw.trim();
        DateTime::parse_from_rfc3339(value)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|source| HeartbeatError::Parse {
                path: path.clone(),
                value: value.to_string(),
                source,
            })
    }

    /// Compare the stored heartbeat with the current time
    pub async fn check_startup(&self) -> Result<StartupCheck, HeartbeatError> {
        let Some(last) = self.read_heartbeat().await? else {
            return Ok(StartupCheck::FirstRun);
        };

        let gap = self.clock.now() - last;
        if gap > to_time_delta(self.config.max_dead_duration) {
            Ok(StartupCheck::Resurrected { gap })
        } else {
            Ok(StartupCheck::Alive { gap })
        }
    }

    /// Durably replace the heartbeat file with the current time
    pub async fn write_heartbeat(&self) -> Result<DateTime<Utc>, HeartbeatError> {
        let now = self.clock.now();
        let path = &self.config.path;
        write_atomic(path, now.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes())
            .await
            .map_err(|source| HeartbeatError::Write {
                path: path.clone(),
                source,
            })?;
        Ok(now)
    }

    /// Check for an outage, then refresh the heartbeat every interval until
    /// cancelled. Returns an error only on a fatal read or write failure.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), HeartbeatError> {
        let check = self.check_startup().await?;
        match check {
            StartupCheck::FirstRun => {
                info!(path = %self.config.path.display(), "No previous heartbeat, first run");
            }
            StartupCheck::Alive { gap } => {
                debug!(gap_secs = gap.num_seconds(), "Previous heartbeat within tolerance");
            }
            StartupCheck::Resurrected { gap } => {
                warn!(
                    gap_secs = gap.num_seconds(),
                    max_dead_secs = self.config.max_dead_duration.as_secs(),
                    "Process was down longer than tolerated, starting recovery"
                );
                spawn_recovery(Arc::clone(&self.recovery), cancel.child_token());
            }
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            path = %self.config.path.display(),
            interval_secs = self.config.interval.as_secs(),
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.write_heartbeat().await {
                error!(error = %e, "Heartbeat write failed");
                return Err(e);
            }
        }

        info!("Heartbeat stopped");
        Ok(())
    }
}

/// Run recovery once in the background; failure is logged only
fn spawn_recovery(recovery: Arc<dyn RecoveryCallback>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let started = Instant::now();
        info!("Recovery started");
        match recovery.recover(cancel).await {
            Ok(()) => info!(
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Recovery finished"
            ),
            Err(e) => error!(
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                error = %e,
                "Recovery failed"
            ),
        }
    });
}

/// Write to a sibling temp file, fsync, then rename over `path`
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::heartbeat::LogOnlyRecovery;
    use chrono::{TimeDelta, TimeZone};
    use std::time::Duration;

    fn watchdog(path: PathBuf, clock: ManualClock) -> HeartbeatWatchdog {
        HeartbeatWatchdog::new(
            HeartbeatConfig {
                path,
                interval: Duration::from_secs(10),
                max_dead_duration: Duration::from_secs(60),
            },
            Arc::new(clock),
            Arc::new(LogOnlyRecovery),
        )
    }

    #[tokio::test]
    async fn missing_file_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Utc::now());
        let wd = watchdog(dir.path().join("heartbeat"), clock);

        assert_eq!(wd.check_startup().await.unwrap(), StartupCheck::FirstRun);
    }

    #[tokio::test]
    async fn gap_classification() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let wd = watchdog(dir.path().join("heartbeat"), clock.clone());

        wd.write_heartbeat().await.unwrap();

        clock.advance(TimeDelta::seconds(30));
        assert_eq!(
            wd.check_startup().await.unwrap(),
            StartupCheck::Alive { gap: TimeDelta::seconds(30) }
        );

        clock.advance(TimeDelta::seconds(31));
        let check = wd.check_startup().await.unwrap();
        assert!(check.needs_recovery());
    }

    #[tokio::test]
    async fn write_creates_parent_and_round_trips_nanos() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let wd = watchdog(dir.path().join("nested/state/heartbeat"), ManualClock::new(start));

        wd.write_heartbeat().await.unwrap();

        assert_eq!(wd.read_heartbeat().await.unwrap(), Some(start));
        assert!(!dir.path().join("nested/state/heartbeat.tmp").exists());
    }

    #[tokio::test]
    async fn garbage_timestamp_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat");
        std::fs::write(&path, "not a time").unwrap();
        let wd = watchdog(path, ManualClock::new(Utc::now()));

        let err = wd.check_startup().await.unwrap_err();
        assert!(matches!(err, HeartbeatError::Parse { .. }));
    }
}
