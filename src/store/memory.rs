//! In-memory status store
//!
//! Thread-safe via `RwLock`. Not durable; contents are lost on restart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{StatusStore, StoreError, WATCH_CHANNEL_CAPACITY};
use crate::types::StatusRecord;

/// In-memory status store for tests and single-process deployments
pub struct InMemoryStatusStore {
    records: RwLock<HashMap<String, StatusRecord>>,
    changes: broadcast::Sender<String>,
    writes: AtomicU64,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            changes,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of successful `update` calls so far
    pub fn update_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn notify(&self, name: &str) {
        // No subscribers is fine.
        let _ = self.changes.send(name.to_string());
    }
}

impl Default for InMemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn get(&self, name: &str) -> Result<StatusRecord, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        records
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<StatusRecord>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut all: Vec<StatusRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn create(&self, mut record: StatusRecord) -> Result<StatusRecord, StoreError> {
        {
            let mut records = self
                .records
                .write()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if records.contains_key(&record.name) {
                return Err(StoreError::AlreadyExists(record.name));
            }
            record.resource_version = 1;
            records.insert(record.name.clone(), record.clone());
        }
        self.notify(&record.name);
        Ok(record)
    }

    async fn update(
        &self,
        mut record: StatusRecord,
        expected_version: u64,
    ) -> Result<StatusRecord, StoreError> {
        {
            let mut records = self
                .records
                .write()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let current = records
                .get_mut(&record.name)
                .ok_or_else(|| StoreError::NotFound(record.name.clone()))?;
            if current.resource_version != expected_version {
                return Err(StoreError::Conflict {
                    name: record.name,
                    expected: expected_version,
                    actual: current.resource_version,
                });
            }
            record.resource_version = expected_version + 1;
            *current = record.clone();
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify(&record.name);
        Ok(record)
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
