//! Status record store
//!
//! The liveness loops only ever talk to the [`StatusStore`] trait:
//! - `InMemoryStatusStore`: for tests and single-process demos
//! - `SledStatusStore`: embedded durable store used by the daemon
//!
//! `StatusInbox` is the hand-off for owners running in another process while
//! the daemon holds the sled database.
//!
//! Updates are compare-and-swap against `resource_version`. A write whose
//! expected version no longer matches is rejected with
//! [`StoreError::Conflict`], never merged.

mod inbox;
mod memory;
mod sled_store;

pub use inbox::{run_inbox, InboxError, StatusInbox};
pub use memory::InMemoryStatusStore;
pub use sled_store::SledStatusStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::StatusRecord;

/// Capacity of the change-notification channel
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("status record '{0}' not found")]
    NotFound(String),
    #[error("status record '{0}' already exists")]
    AlreadyExists(String),
    #[error("conflict writing '{name}': expected version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("storage error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Keyed collection of status records shared by targets and watchdog loops.
///
/// Implementations must be thread-safe for shared access across tasks.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Fetch a record by name
    async fn get(&self, name: &str) -> Result<StatusRecord, StoreError>;

    /// All records currently stored
    async fn list(&self) -> Result<Vec<StatusRecord>, StoreError>;

    /// Insert a new record. Its version is set to 1.
    async fn create(&self, record: StatusRecord) -> Result<StatusRecord, StoreError>;

    /// Replace a record if its stored version still equals `expected_version`.
    ///
    /// Returns the written record with its new version.
    async fn update(
        &self,
        record: StatusRecord,
        expected_version: u64,
    ) -> Result<StatusRecord, StoreError>;

    /// Subscribe to names of records that were created or changed
    fn watch(&self) -> broadcast::Receiver<String>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;

    /// Create the record or replace whatever is stored under its name.
    ///
    /// This is the owner-side write path: the target's own control loop
    /// publishing a fresh status.
    async fn apply(&self, record: StatusRecord) -> Result<StatusRecord, StoreError> {
        const ATTEMPTS: usize = 3;
        let mut last_err = None;
        for _ in 0..ATTEMPTS {
            let result = match self.get(&record.name).await {
                Ok(current) => self.update(record.clone(), current.resource_version).await,
                Err(e) if e.is_not_found() => self.create(record.clone()).await,
                Err(e) => return Err(e),
            };
            match result {
                Ok(written) => return Ok(written),
                Err(e) if e.is_conflict() || matches!(e, StoreError::AlreadyExists(_)) => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Backend("apply retries exhausted".to_string())))
    }
}
