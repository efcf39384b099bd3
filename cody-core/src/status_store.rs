//! Status store implementations.
//!
//! # Storage layout ([`FsStatusStore`])
//!
//! ```text
//! <root>/
//!   <repository>/
//!     <branch>.yaml       (one document per key, mode 0600)
//! ```
//!
//! Repository and branch names are percent-encoded into single path
//! components, so `feature/x` becomes `feature%2Fx.yaml`.
//!
//! Conditional updates run read → [`apply_conditional`] → atomic save under a
//! process-wide lock. Save flow: serialize → `.yaml.tmp` sibling →
//! `chmod 0600` → `rename`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::backend::StatusStore;
use crate::error::{io_err, BackendError};
use crate::status::{apply_conditional, Condition, StatusUpdate, UpdateOutcome};
use crate::types::{PublishTarget, StatusKey};

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store; every operation is linearizable through one lock.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<StatusKey, PublishTarget>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record without a condition (test setup).
    pub fn insert(&self, key: StatusKey, record: PublishTarget) -> Result<(), BackendError> {
        self.lock()?.insert(key, record);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<StatusKey, PublishTarget>>, BackendError> {
        self.records.lock().map_err(|_| BackendError::Unavailable {
            service: "status store",
            message: "lock poisoned".to_string(),
        })
    }
}

impl StatusStore for MemoryStatusStore {
    fn get_consistent(&self, key: &StatusKey) -> Result<Option<PublishTarget>, BackendError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn conditional_update(
        &self,
        key: &StatusKey,
        update: &StatusUpdate,
        condition: &Condition,
    ) -> Result<UpdateOutcome, BackendError> {
        let mut records = self.lock()?;
        let outcome = apply_conditional(records.get(key).cloned(), update, condition);
        if let UpdateOutcome::Applied(record) = &outcome {
            records.insert(key.clone(), record.clone());
        }
        Ok(outcome)
    }

    fn list(&self) -> Result<Vec<(StatusKey, PublishTarget)>, BackendError> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// On-disk status document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusDocument {
    repository: String,
    branch: String,
    target: PublishTarget,
}

/// One YAML document per repository/branch under `root`.
///
/// Single-writer-process: the lock serialises updates inside this process
/// only.
#[derive(Debug)]
pub struct FsStatusStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FsStatusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<repository>/<branch>.yaml`; pure, no I/O.
    pub fn document_path(&self, key: &StatusKey) -> PathBuf {
        self.root
            .join(encode_component(key.repository.as_str()))
            .join(format!("{}.yaml", encode_component(key.branch.as_str())))
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, BackendError> {
        self.lock.lock().map_err(|_| BackendError::Unavailable {
            service: "status store",
            message: "lock poisoned".to_string(),
        })
    }

    fn load(&self, key: &StatusKey) -> Result<Option<PublishTarget>, BackendError> {
        let path = self.document_path(key);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&path, err)),
        };
        let document: StatusDocument = serde_yaml::from_str(&contents)?;
        Ok(Some(document.target))
    }

    fn save(&self, key: &StatusKey, target: &PublishTarget) -> Result<(), BackendError> {
        let path = self.document_path(key);
        let Some(dir) = path.parent() else {
            return Err(io_err(path, std::io::Error::other("invalid status path")));
        };
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            set_dir_permissions(dir)?;
        }

        let document = StatusDocument {
            repository: key.repository.0.clone(),
            branch: key.branch.0.clone(),
            target: target.clone(),
        };
        let yaml = serde_yaml::to_string(&document)?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
        set_file_permissions(&tmp)?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, err));
        }
        tracing::debug!(key = %key, batch = target.batch, remaining = target.remaining_actions, "status saved");
        Ok(())
    }
}

impl StatusStore for FsStatusStore {
    fn get_consistent(&self, key: &StatusKey) -> Result<Option<PublishTarget>, BackendError> {
        let _guard = self.guard()?;
        self.load(key)
    }

    fn conditional_update(
        &self,
        key: &StatusKey,
        update: &StatusUpdate,
        condition: &Condition,
    ) -> Result<UpdateOutcome, BackendError> {
        let _guard = self.guard()?;
        let outcome = apply_conditional(self.load(key)?, update, condition);
        if let UpdateOutcome::Applied(record) = &outcome {
            self.save(key, record)?;
        }
        Ok(outcome)
    }

    fn list(&self) -> Result<Vec<(StatusKey, PublishTarget)>, BackendError> {
        let _guard = self.guard()?;
        if !self.root.exists() {
            return Ok(vec![]);
        }

        let mut result = Vec::new();
        let repo_dirs = std::fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))?;
        for repo_dir in repo_dirs {
            let repo_dir = repo_dir.map_err(|e| io_err(&self.root, e))?;
            if !repo_dir.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let dir = repo_dir.path();
            for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                let path = entry.path();
                let is_document = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.ends_with(".yaml"))
                    .unwrap_or(false);
                if !is_document {
                    continue;
                }
                let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
                let document: StatusDocument = serde_yaml::from_str(&contents)?;
                result.push((
                    StatusKey::new(document.repository, document.branch),
                    document.target,
                ));
            }
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }
}

/// Percent-encode a name into a single safe path component.
pub fn encode_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (index, byte) in name.bytes().enumerate() {
        let safe = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && index > 0);
        if safe {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), BackendError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), BackendError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), BackendError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), BackendError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
