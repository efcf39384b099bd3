//! Spool-directory action queue.
//!
//! # Storage layout
//!
//! ```text
//! <dir>/
//!   <millis>-<pid>-<seq>.json         (one publish action per file)
//!   <millis>-<pid>-<seq>.json.lease   (lease expiry, unix millis)
//!   <millis>-<pid>-<seq>.json.tmp     (in-progress write)
//!   corrupt/<name>.json               (payloads that failed to parse)
//! ```
//!
//! File names sort by enqueue time, which gives best-effort FIFO order. A
//! dequeued message gets a lease marker; it is handed out again once the
//! lease expires without an ack. Ack removes payload and lease.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

use cody_core::{error::io_err, ActionQueue, BackendError, Delivery, PublishAction};

const PAYLOAD_EXT: &str = "json";
const LEASE_EXT: &str = "json.lease";
const TMP_EXT: &str = "json.tmp";
const CORRUPT_DIR: &str = "corrupt";

#[derive(Debug)]
pub struct SpoolQueue {
    dir: PathBuf,
    visibility_timeout: Duration,
    counter: AtomicU64,
}

impl SpoolQueue {
    pub fn new(dir: impl Into<PathBuf>, visibility_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            visibility_timeout,
            counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn payload_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{PAYLOAD_EXT}"))
    }

    fn lease_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{LEASE_EXT}"))
    }

    fn ensure_dir(&self) -> Result<(), BackendError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))
    }

    /// Message names (file stems) in enqueue order.
    pub fn message_names(&self) -> Result<Vec<String>, BackendError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))? {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            if let Some(stem) = file_name.strip_suffix(".json") {
                if !stem.is_empty() && !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Number of unacked messages, leased or not.
    pub fn len(&self) -> Result<usize, BackendError> {
        Ok(self.message_names()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, BackendError> {
        Ok(self.len()? == 0)
    }

    /// Whether `name` carries a lease that has not expired yet.
    fn is_leased(&self, name: &str, now_millis: i64) -> Result<bool, BackendError> {
        let path = self.lease_path(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(io_err(&path, err)),
        };
        // An unreadable lease is treated as expired.
        Ok(contents
            .trim()
            .parse::<i64>()
            .map(|expiry| expiry > now_millis)
            .unwrap_or(false))
    }

    fn write_lease(&self, name: &str, expiry_millis: i64) -> Result<(), BackendError> {
        let path = self.lease_path(name);
        let tmp = self.dir.join(format!("{name}.{LEASE_EXT}.tmp"));
        std::fs::write(&tmp, expiry_millis.to_string()).map_err(|e| io_err(&tmp, e))?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, err));
        }
        Ok(())
    }

    fn quarantine(&self, name: &str, reason: &serde_json::Error) -> Result<(), BackendError> {
        let corrupt_dir = self.dir.join(CORRUPT_DIR);
        std::fs::create_dir_all(&corrupt_dir).map_err(|e| io_err(&corrupt_dir, e))?;
        let from = self.payload_path(name);
        let to = corrupt_dir.join(format!("{name}.{PAYLOAD_EXT}"));
        std::fs::rename(&from, &to).map_err(|e| io_err(&from, e))?;
        remove_if_present(&self.lease_path(name))?;
        tracing::warn!(message = name, error = %reason, "quarantined unreadable queue message");
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<(), BackendError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

fn validate_receipt(receipt: &str) -> Result<(), BackendError> {
    let unsafe_name = receipt.is_empty()
        || receipt.starts_with('.')
        || receipt.contains('/')
        || receipt.contains('\\')
        || receipt.contains('\0');
    if unsafe_name {
        return Err(BackendError::InvalidName {
            kind: "queue receipt",
            name: receipt.to_string(),
        });
    }
    Ok(())
}

impl ActionQueue for SpoolQueue {
    fn enqueue(&self, action: &PublishAction) -> Result<(), BackendError> {
        self.ensure_dir()?;
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{:020}-{:010}-{:08}",
            Utc::now().timestamp_millis(),
            std::process::id(),
            seq
        );
        let json = serde_json::to_vec(action)?;

        let tmp = self.dir.join(format!("{name}.{TMP_EXT}"));
        let path = self.payload_path(&name);
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, err));
        }
        tracing::debug!(message = %name, path = %action.path, kind = %action.kind, "enqueued");
        Ok(())
    }

    fn dequeue_one(&self) -> Result<Option<Delivery>, BackendError> {
        let now = Utc::now().timestamp_millis();
        let lease_millis = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);

        for name in self.message_names()? {
            if self.is_leased(&name, now)? {
                continue;
            }
            let path = self.payload_path(&name);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                // Acked by someone else since the listing.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&path, err)),
            };
            let action: PublishAction = match serde_json::from_slice(&bytes) {
                Ok(action) => action,
                Err(err) => {
                    self.quarantine(&name, &err)?;
                    continue;
                }
            };
            self.write_lease(&name, now.saturating_add(lease_millis))?;
            return Ok(Some(Delivery {
                receipt: name,
                action,
            }));
        }
        Ok(None)
    }

    fn ack(&self, receipt: &str) -> Result<(), BackendError> {
        validate_receipt(receipt)?;
        remove_if_present(&self.payload_path(receipt))?;
        remove_if_present(&self.lease_path(receipt))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cody_core::{CommitEvent, DiffEntry};
    use tempfile::TempDir;

    fn action(path: &str, sequence: u32) -> PublishAction {
        let event = CommitEvent::new("site", "main", "c1");
        PublishAction::from_entry(&event, 1, sequence, &DiffEntry::added(path, "b1"))
            .expect("action")
    }

    #[test]
    fn messages_come_out_in_enqueue_order() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = SpoolQueue::new(tmp.path().join("queue"), Duration::from_secs(60));
        queue.enqueue(&action("content/a.txt", 0)).expect("enqueue");
        queue.enqueue(&action("content/b.txt", 1)).expect("enqueue");

        let first = queue.dequeue_one().expect("dequeue").expect("message");
        let second = queue.dequeue_one().expect("dequeue").expect("message");
        assert_eq!(first.action.path, "content/a.txt");
        assert_eq!(second.action.path, "content/b.txt");
        assert!(queue.dequeue_one().expect("dequeue").is_none(), "both leased");
    }

    #[test]
    fn expired_lease_makes_message_visible_again() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = SpoolQueue::new(tmp.path(), Duration::ZERO);
        queue.enqueue(&action("content/a.txt", 0)).expect("enqueue");

        let first = queue.dequeue_one().expect("dequeue").expect("message");
        let again = queue.dequeue_one().expect("dequeue").expect("redelivered");
        assert_eq!(first.receipt, again.receipt);
    }

    #[test]
    fn ack_removes_payload_and_lease() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = SpoolQueue::new(tmp.path(), Duration::from_secs(60));
        queue.enqueue(&action("content/a.txt", 0)).expect("enqueue");
        let delivery = queue.dequeue_one().expect("dequeue").expect("message");
        assert!(queue.lease_path(&delivery.receipt).exists());

        queue.ack(&delivery.receipt).expect("ack");
        queue.ack(&delivery.receipt).expect("second ack is a no-op");
        assert!(queue.is_empty().expect("len"));
        assert!(!queue.lease_path(&delivery.receipt).exists());
    }

    #[test]
    fn corrupt_payload_is_quarantined_and_skipped() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = SpoolQueue::new(tmp.path(), Duration::from_secs(60));
        std::fs::write(tmp.path().join("00000000000000000001-0000000001-00000000.json"), b"{oops")
            .expect("write");
        queue.enqueue(&action("content/a.txt", 0)).expect("enqueue");

        let delivery = queue.dequeue_one().expect("dequeue").expect("message");
        assert_eq!(delivery.action.path, "content/a.txt");
        assert!(tmp
            .path()
            .join(CORRUPT_DIR)
            .join("00000000000000000001-0000000001-00000000.json")
            .exists());
    }

    #[test]
    fn receipts_cannot_escape_the_spool() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = SpoolQueue::new(tmp.path(), Duration::from_secs(60));
        let err = queue.ack("../status/site").unwrap_err();
        assert!(matches!(err, BackendError::InvalidName { .. }));
    }

    #[test]
    fn missing_directory_is_an_empty_queue() {
        let tmp = TempDir::new().expect("tempdir");
        let queue = SpoolQueue::new(tmp.path().join("absent"), Duration::from_secs(60));
        assert!(queue.dequeue_one().expect("dequeue").is_none());
        assert_eq!(queue.len().expect("len"), 0);
    }
}
