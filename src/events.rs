//! Notification events emitted by the liveness loops
//!
//! One warning event is recorded per staleness determination. Recording is
//! best-effort: a sink that fails to persist logs and moves on, it never
//! fails the sync that produced the event.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::config::defaults::MAX_EVENTS;

const EVENTS_TREE: &str = "events";

/// Event severity. Only staleness determinations are recorded, all as warnings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Warning,
}

/// A notification about one target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    /// Name of the status record the event is about
    pub target: String,
    pub kind: EventKind,
    /// Fixed machine-readable reason code
    pub reason: String,
    pub message: String,
}

impl Event {
    pub fn warning(
        timestamp: DateTime<Utc>,
        target: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            target: target.into(),
            kind: EventKind::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Sink for notification events
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

// ============================================================================
// Tracing recorder
// ============================================================================

/// Emits events as log lines only
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, event: Event) {
        match event.kind {
            EventKind::Warning => warn!(
                target_name = %event.target,
                reason = %event.reason,
                "{}", event.message
            ),
        }
    }
}

// ============================================================================
// In-memory recorder
// ============================================================================

/// Keeps events in memory, oldest first
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

// ============================================================================
// Sled event log
// ============================================================================

/// Persists events in the `events` sled tree.
///
/// Keys are ids from `Db::generate_id` as big-endian bytes, so iteration
/// order is insertion order. The log keeps at most `max_events` entries;
/// older ones are pruned on insert.
#[derive(Clone)]
pub struct SledEventLog {
    db: Db,
    tree: Tree,
    max_events: usize,
}

impl SledEventLog {
    pub fn from_db(db: &Db) -> Result<Self, sled::Error> {
        let tree = db.open_tree(EVENTS_TREE)?;
        Ok(Self {
            db: db.clone(),
            tree,
            max_events: MAX_EVENTS,
        })
    }

    /// Retention cap (at least one event is always kept)
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events.max(1);
        self
    }

    fn persist(&self, event: &Event) -> Result<(), String> {
        let id = self.db.generate_id().map_err(|e| e.to_string())?;
        let bytes = serde_json::to_vec(event).map_err(|e| e.to_string())?;
        self.tree
            .insert(id.to_be_bytes(), bytes)
            .map_err(|e| e.to_string())?;

        let pruned = self.prune().map_err(|e| e.to_string())?;
        if pruned > 0 {
            debug!(pruned, max_events = self.max_events, "Pruned old events");
        }
        Ok(())
    }

    /// Remove everything older than the newest `max_events` entries
    pub fn prune(&self) -> Result<usize, sled::Error> {
        let Some((cutoff, _)) = self.tree.iter().rev().nth(self.max_events).transpose()? else {
            return Ok(0);
        };

        let keys_to_delete = self
            .tree
            .range(..=cutoff)
            .map(|item| item.map(|(key, _)| key))
            .collect::<Result<Vec<_>, _>>()?;

        for key in &keys_to_delete {
            self.tree.remove(key)?;
        }
        Ok(keys_to_delete.len())
    }

    /// Most recent events, newest first
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        self.tree
            .iter()
            .rev()
            .filter_map(|item| item.ok())
            .filter_map(|(_, value)| serde_json::from_slice::<Event>(&value).ok())
            .take(limit)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl EventRecorder for SledEventLog {
    fn record(&self, event: Event) {
        if let Err(e) = self.persist(&event) {
            warn!(target_name = %event.target, error = %e, "Failed to persist event");
        }
        TracingRecorder.record(event);
    }
}
