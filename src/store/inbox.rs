//! Status inbox: directory-backed hand-off for owner writes
//!
//! sled allows a single process per database, so while the daemon runs a
//! second process cannot open the store. Owners instead drop their fresh
//! status into the inbox directory as a JSON file; the daemon polls the
//! directory and applies each file through [`StatusStore::apply`], removing
//! it once the write lands. Files are written under a `.tmp` name and
//! renamed, so a poll never sees a partial record.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::StatusStore;
use crate::types::StatusRecord;

/// Breaks timestamp ties between submissions from one process
static SUBMIT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Owner submissions waiting to be applied
#[derive(Debug, Clone)]
pub struct StatusInbox {
    dir: PathBuf,
}

impl StatusInbox {
    /// Create or open an inbox at the given directory
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, InboxError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| InboxError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue a record for the daemon to apply. Returns the file written.
    pub fn submit(&self, record: &StatusRecord) -> Result<PathBuf, InboxError> {
        let json =
            serde_json::to_vec_pretty(record).map_err(|e| InboxError::Serialization(e.to_string()))?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = SUBMIT_SEQ.fetch_add(1, Ordering::Relaxed);
        let stem = format!(
            "{nanos:020}-{seq:08}-{}-{}",
            process::id(),
            safe_name(&record.name)
        );
        let tmp = self.dir.join(format!("{stem}.tmp"));
        let path = self.dir.join(format!("{stem}.json"));

        fs::write(&tmp, &json).map_err(|e| InboxError::Io(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| InboxError::Io(e.to_string()))?;

        debug!(target_name = %record.name, path = %path.display(), "Status queued in inbox");
        Ok(path)
    }

    /// Pending submissions, oldest first
    pub fn pending(&self) -> Result<Vec<PathBuf>, InboxError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| InboxError::Io(e.to_string()))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect();
        // File names start with a zero-padded timestamp
        paths.sort();
        Ok(paths)
    }

    /// Apply every pending submission to `store`.
    ///
    /// Corrupted files are removed. A store failure stops the pass and leaves
    /// the file in place for the next one, so submissions for one target are
    /// never applied out of order.
    pub async fn ingest(&self, store: &dyn StatusStore) -> Result<usize, InboxError> {
        let mut applied = 0;
        for path in self.pending()? {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Could not read inbox entry");
                    continue;
                }
            };

            let record: StatusRecord = match serde_json::from_slice(&data) {
                Ok(record) => record,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Corrupted inbox entry, removing");
                    let _ = tokio::fs::remove_file(&path).await;
                    continue;
                }
            };

            let name = record.name.clone();
            if let Err(e) = store.apply(record).await {
                warn!(target_name = %name, error = %e, "Inbox apply failed, will retry");
                break;
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| InboxError::Io(e.to_string()))?;
            debug!(target_name = %name, "Applied status from inbox");
            applied += 1;
        }
        Ok(applied)
    }
}

/// Poll the inbox until cancelled
pub async fn run_inbox(
    inbox: StatusInbox,
    store: Arc<dyn StatusStore>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    info!(dir = %inbox.dir().display(), "Status inbox polling started");
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match inbox.ingest(store.as_ref()).await {
                    Ok(0) => {}
                    Ok(n) => info!(applied = n, "Applied owner status from inbox"),
                    Err(e) => warn!(error = %e, "Inbox poll failed"),
                }
            }
        }
    }
    debug!("Status inbox polling stopped");
}

fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Inbox errors
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStatusStore;
    use crate::types::{Condition, ConditionStatus, ConditionType};
    use chrono::{TimeZone, Utc};

    fn owner_status(name: &str, message: &str) -> StatusRecord {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        StatusRecord::new(name).with_condition(
            Condition::new(ConditionType::Available, ConditionStatus::True, at).with_message(message),
        )
    }

    #[tokio::test]
    async fn submitted_status_is_applied_and_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let inbox = StatusInbox::open(tmp.path().join("inbox")).unwrap();
        let store = InMemoryStatusStore::new();

        inbox.submit(&owner_status("etcd", "first")).unwrap();
        inbox.submit(&owner_status("etcd", "second")).unwrap();
        assert_eq!(inbox.pending().unwrap().len(), 2);

        assert_eq!(inbox.ingest(&store).await.unwrap(), 2);
        assert!(inbox.pending().unwrap().is_empty());
        // Later submission wins
        assert_eq!(store.get("etcd").await.unwrap().conditions[0].message, "second");
    }

    #[tokio::test]
    async fn corrupted_entry_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let inbox = StatusInbox::open(tmp.path()).unwrap();
        fs::write(tmp.path().join("0-bad.json"), b"{not json").unwrap();
        inbox.submit(&owner_status("etcd", "ok")).unwrap();

        let store = InMemoryStatusStore::new();
        assert_eq!(inbox.ingest(&store).await.unwrap(), 1);
        assert!(inbox.pending().unwrap().is_empty());
        assert!(store.get("etcd").await.is_ok());
    }

    #[tokio::test]
    async fn partial_writes_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let inbox = StatusInbox::open(tmp.path()).unwrap();
        fs::write(tmp.path().join("1-etcd.tmp"), b"{\"name\":").unwrap();

        let store = InMemoryStatusStore::new();
        assert_eq!(inbox.ingest(&store).await.unwrap(), 0);
        assert!(tmp.path().join("1-etcd.tmp").exists());
    }

    #[test]
    fn names_are_sanitized_for_file_names() {
        let tmp = tempfile::tempdir().unwrap();
        let inbox = StatusInbox::open(tmp.path()).unwrap();
        let path = inbox.submit(&owner_status("../kube/apiserver", "x")).unwrap();
        assert_eq!(path.parent(), Some(tmp.path()));
        let file = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file.ends_with("-___kube_apiserver.json"), "{file}");
    }
}
