//! Sled-backed status store
//!
//! Records live in the `status_records` tree as JSON keyed by name. Updates
//! use sled's `compare_and_swap` on the exact bytes that were read, so a
//! concurrent writer between our version check and our write still loses
//! nothing: the swap fails and surfaces as a conflict.

use std::path::Path;

use async_trait::async_trait;
use sled::{Db, IVec, Tree};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{StatusStore, StoreError, WATCH_CHANNEL_CAPACITY};
use crate::types::StatusRecord;

const RECORDS_TREE: &str = "status_records";

/// Durable status store on an embedded sled database
#[derive(Clone)]
pub struct SledStatusStore {
    tree: Tree,
    changes: broadcast::Sender<String>,
}

impl SledStatusStore {
    /// Open or create a store at the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(&db)
    }

    /// Use the records tree inside an already opened database
    pub fn from_db(db: &Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(RECORDS_TREE)?;
        let (changes, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        spawn_change_feed(&tree, changes.clone())?;
        Ok(Self { tree, changes })
    }

    fn decode(bytes: &IVec) -> Result<StatusRecord, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Forward sled key events to the broadcast channel on a dedicated thread.
///
/// The sled subscriber iterator blocks, so it cannot run on the async runtime.
/// The thread exits once the tree is dropped and the subscriber closes.
fn spawn_change_feed(tree: &Tree, changes: broadcast::Sender<String>) -> Result<(), StoreError> {
    let subscriber = tree.watch_prefix(Vec::new());
    std::thread::Builder::new()
        .name("status-watch".to_string())
        .spawn(move || {
            for event in subscriber {
                let key = match &event {
                    sled::Event::Insert { key, .. } | sled::Event::Remove { key } => key,
                };
                match std::str::from_utf8(key) {
                    Ok(name) => {
                        let _ = changes.send(name.to_string());
                    }
                    Err(e) => warn!(error = %e, "Ignoring non UTF-8 status record key"),
                }
            }
            debug!("Status change feed closed");
        })
        .map_err(|e| StoreError::Backend(format!("failed to spawn watch thread: {e}")))?;
    Ok(())
}

#[async_trait]
impl StatusStore for SledStatusStore {
    async fn get(&self, name: &str) -> Result<StatusRecord, StoreError> {
        match self.tree.get(name.as_bytes())? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<StatusRecord>, StoreError> {
        let mut records = Vec::with_capacity(self.tree.len());
        for item in self.tree.iter() {
            let (key, value) = item?;
            match Self::decode(&value) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "Skipping undecodable status record"
                    );
                }
            }
        }
        Ok(records)
    }

    async fn create(&self, mut record: StatusRecord) -> Result<StatusRecord, StoreError> {
        record.resource_version = 1;
        let bytes = serde_json::to_vec(&record)?;
        match self
            .tree
            .compare_and_swap(record.name.as_bytes(), None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                self.tree.flush_async().await?;
                Ok(record)
            }
            Err(_) => Err(StoreError::AlreadyExists(record.name)),
        }
    }

    async fn update(
        &self,
        mut record: StatusRecord,
        expected_version: u64,
    ) -> Result<StatusRecord, StoreError> {
        let key = record.name.clone();
        let current = self
            .tree
            .get(key.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let stored = Self::decode(&current)?;
        if stored.resource_version != expected_version {
            return Err(StoreError::Conflict {
                name: key,
                expected: expected_version,
                actual: stored.resource_version,
            });
        }

        record.resource_version = expected_version + 1;
        let bytes = serde_json::to_vec(&record)?;

        match self
            .tree
            .compare_and_swap(key.as_bytes(), Some(&current), Some(bytes))?
        {
            Ok(()) => {
                self.tree.flush_async().await?;
                Ok(record)
            }
            Err(cas) => {
                let actual = cas
                    .current
                    .as_ref()
                    .and_then(|b| Self::decode(b).ok())
                    .map_or(0, |r| r.resource_version);
                Err(StoreError::Conflict {
                    name: key,
                    expected: expected_version,
                    actual,
                })
            }
        }
    }

    fn watch(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
