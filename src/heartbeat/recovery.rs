//! Recovery callbacks fired after a detected outage

use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Work to run once when the process comes back after too long a gap
#[async_trait]
pub trait RecoveryCallback: Send + Sync {
    /// Run recovery. `cancel` fires on process shutdown.
    async fn recover(&self, cancel: CancellationToken) -> Result<()>;
}

type RecoveryFn = dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Adapts an async closure into a [`RecoveryCallback`]
#[derive(Clone)]
pub struct FnRecovery {
    f: Arc<RecoveryFn>,
}

impl FnRecovery {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |cancel| Box::pin(f(cancel))),
        }
    }
}

impl std::fmt::Debug for FnRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnRecovery").finish_non_exhaustive()
    }
}

#[async_trait]
impl RecoveryCallback for FnRecovery {
    async fn recover(&self, cancel: CancellationToken) -> Result<()> {
        (self.f)(cancel).await
    }
}

/// Runs a shell command (`sh -c`) as recovery. Killed on shutdown.
#[derive(Debug, Clone)]
pub struct CommandRecovery {
    command: String,
}

impl CommandRecovery {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl RecoveryCallback for CommandRecovery {
    async fn recover(&self, cancel: CancellationToken) -> Result<()> {
        info!(command = %self.command, "Running recovery command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn recovery command: {}", self.command))?;

        let status = tokio::select! {
            status = child.wait() => status.context("Failed to wait for recovery command")?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                bail!("Recovery command cancelled by shutdown");
            }
        };

        if !status.success() {
            bail!("Recovery command exited with {status}");
        }
        Ok(())
    }
}

/// Records the outage in the log and does nothing else
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyRecovery;

#[async_trait]
impl RecoveryCallback for LogOnlyRecovery {
    async fn recover(&self, _cancel: CancellationToken) -> Result<()> {
        warn!("Process was down longer than tolerated; no recovery command configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fn_recovery_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let recovery = FnRecovery::new(move |_cancel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        recovery.recover(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_recovery_reports_exit_status() {
        CommandRecovery::new("true")
            .recover(CancellationToken::new())
            .await
            .unwrap();

        let err = CommandRecovery::new("exit 3")
            .recover(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_recovery_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = CommandRecovery::new("sleep 30")
            .recover(cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
