//! De-duplicating work queue of target names
//!
//! Guarantees a name is handed to at most one worker at a time:
//! - a name enqueued while waiting is stored once
//! - a name enqueued while being processed is held back and redelivered
//!   after [`WorkQueue::complete`]
//!
//! Failed names come back through [`WorkQueue::requeue_rate_limited`] after
//! a per-name exponential delay.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use super::backoff::ItemBackoff;

#[derive(Debug, Default)]
struct QueueState {
    /// Names ready to be claimed, in arrival order
    ready: VecDeque<String>,
    /// Names waiting to be processed (ready, or held back behind an in-flight run)
    dirty: HashSet<String>,
    /// Names currently claimed by a worker
    processing: HashSet<String>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ItemBackoff,
}

/// Shared handle to a work queue. Clones refer to the same queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(backoff: ItemBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a name. No-op if it is already waiting.
    pub fn enqueue(&self, name: &str) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(name) {
            return;
        }
        state.dirty.insert(name.to_string());
        if state.processing.contains(name) {
            return;
        }
        state.ready.push_back(name.to_string());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add a name once `delay` has elapsed
    pub fn enqueue_after(&self, name: &str, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(name);
            return;
        }
        let queue = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(&name);
        });
    }

    /// Re-add a failed name after its backoff delay
    pub fn requeue_rate_limited(&self, name: &str) -> Duration {
        let delay = self.inner.backoff.next_delay(name);
        self.enqueue_after(name, delay);
        delay
    }

    /// Consecutive failures recorded for a name
    pub fn failures(&self, name: &str) -> u32 {
        self.inner.backoff.failures(name)
    }

    /// Reset a name's backoff after a successful sync
    pub fn forget(&self, name: &str) {
        self.inner.backoff.forget(name);
    }

    /// Wait for the next name. Returns `None` once the queue is shut down.
    pub async fn claim(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(name) = state.ready.pop_front() {
                    state.dirty.remove(&name);
                    state.processing.insert(name.clone());
                    return Some(name);
                }
            }

            notified.await;
        }
    }

    /// Mark a claimed name as finished, redelivering it if it changed meanwhile
    pub fn complete(&self, name: &str) {
        let mut state = self.state();
        state.processing.remove(name);
        if state.dirty.contains(name) && !state.shutting_down {
            state.ready.push_back(name.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out names and wake every waiting worker
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Names ready to be claimed
    pub fn len(&self) -> usize {
        self.state().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
