//! Reconciliation controller runtime
//!
//! Drives a [`Reconciler`] from three sources of work:
//! - the store's change feed (every written record name)
//! - a periodic resync over every stored record
//! - rate-limited retries of failed syncs
//!
//! N workers drain one [`WorkQueue`]. The queue never hands the same name to
//! two workers at once, so reconcilers may keep per-name state without
//! cross-name locking.

pub mod backoff;
pub mod queue;

pub use backoff::ItemBackoff;
pub use queue::WorkQueue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{StatusStore, StoreError};

/// Per-target synchronization logic
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name for logging
    fn name(&self) -> &'static str;

    /// Bring one target in line. Errors are retried with backoff.
    async fn sync(&self, target: &str) -> Result<(), StoreError>;
}

/// Controller tuning
#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub workers: usize,
    pub resync_period: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

/// Runs a reconciler against a status store until cancelled
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    store: Arc<dyn StatusStore>,
    queue: WorkQueue,
    options: ControllerOptions,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, store: Arc<dyn StatusStore>, options: ControllerOptions) -> Self {
        let queue = WorkQueue::new(ItemBackoff::new(
            options.retry_base_delay,
            options.retry_max_delay,
        ));
        Self {
            reconciler,
            store,
            queue,
            options,
        }
    }

    /// Handle to the controller's queue
    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Run until `cancel` fires, then drain workers and return
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let name = self.reconciler.name();
        let workers = self.options.workers.max(1);
        info!(
            controller = name,
            workers,
            resync_secs = self.options.resync_period.as_secs(),
            backend = self.store.backend_name(),
            "Controller started"
        );

        let mut tasks = JoinSet::new();

        // Subscribe before the initial listing so no write is missed in between.
        let changes = self.store.watch();
        tasks.spawn(feed_changes(
            name,
            changes,
            Arc::clone(&self.store),
            self.queue.clone(),
            cancel.clone(),
        ));
        tasks.spawn(resync_loop(
            name,
            Arc::clone(&self.store),
            self.queue.clone(),
            self.options.resync_period,
            cancel.clone(),
        ));
        for id in 0..workers {
            tasks.spawn(worker(
                name,
                id,
                Arc::clone(&self.reconciler),
                self.queue.clone(),
            ));
        }

        cancel.cancelled().await;
        info!(controller = name, "Shutdown signal received, stopping workers");
        self.queue.shut_down();

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(controller = name, error = %e, "Controller task panicked");
            }
        }

        info!(controller = name, "Controller stopped");
        Ok(())
    }
}

/// Enqueue every stored record name
async fn enqueue_all(controller: &str, store: &dyn StatusStore, queue: &WorkQueue) {
    match store.list().await {
        Ok(records) => {
            debug!(controller, count = records.len(), "Resync");
            for record in records {
                queue.enqueue(&record.name);
            }
        }
        Err(e) => warn!(controller, error = %e, "Resync listing failed"),
    }
}

async fn feed_changes(
    controller: &'static str,
    mut changes: tokio::sync::broadcast::Receiver<String>,
    store: Arc<dyn StatusStore>,
    queue: WorkQueue,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            change = changes.recv() => match change {
                Ok(target) => queue.enqueue(&target),
                Err(RecvError::Lagged(missed)) => {
                    warn!(controller, missed, "Change feed lagged, resyncing everything");
                    enqueue_all(controller, store.as_ref(), &queue).await;
                }
                Err(RecvError::Closed) => {
                    warn!(controller, "Change feed closed, relying on periodic resync");
                    return;
                }
            },
        }
    }
}

async fn resync_loop(
    controller: &'static str,
    store: Arc<dyn StatusStore>,
    queue: WorkQueue,
    period: Duration,
    cancel: CancellationToken,
) {
    loop {
        enqueue_all(controller, store.as_ref(), &queue).await;

        // Up to 10% jitter so co-deployed controllers don't resync in lockstep
        let jitter_ms = u64::try_from(period.as_millis() / 10).unwrap_or(u64::MAX);
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(period + jitter) => {}
        }
    }
}

async fn worker<R: Reconciler>(controller: &'static str, id: usize, reconciler: Arc<R>, queue: WorkQueue) {
    debug!(controller, worker = id, "Worker started");
    while let Some(target) = queue.claim().await {
        match reconciler.sync(&target).await {
            Ok(()) => queue.forget(&target),
            Err(e) => {
                let delay = queue.requeue_rate_limited(&target);
                warn!(
                    controller,
                    target_name = %target,
                    error = %e,
                    failures = queue.failures(&target),
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Sync failed, requeueing"
                );
            }
        }
        queue.complete(&target);
    }
    debug!(controller, worker = id, "Worker stopped");
}
