//! Filesystem target store.
//!
//! Objects live at `<root>/<bucket>/<key>`; per-object metadata (content
//! type, SHA-256) at `<root>/.meta/<bucket>/<key>.json`.
//!
//! ## `put` — protocol
//!
//! 1. SHA-256 hash the body.
//! 2. Compare with the recorded hash → skip if identical and the object exists.
//! 3. Write to `<path>.cody.tmp`.
//! 4. Rename to final path (atomic on POSIX).
//! 5. Write the metadata document the same way.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use cody_core::{error::io_err, BackendError, BlobStore, ObjectLocation};

const META_DIR: &str = ".meta";

/// Metadata recorded next to every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub content_type: String,
    pub sha256: String,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<bucket>/<key>` after validating both.
    pub fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf, BackendError> {
        let components = validate(location)?;
        let mut path = self.root.join(&location.bucket);
        for component in components {
            path.push(component);
        }
        Ok(path)
    }

    fn meta_path(&self, location: &ObjectLocation) -> Result<PathBuf, BackendError> {
        let components = validate(location)?;
        let mut path = self.root.join(META_DIR).join(&location.bucket);
        for component in components {
            path.push(component);
        }
        let mut file_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        file_name.push(".json");
        path.set_file_name(file_name);
        Ok(path)
    }

    /// Body and metadata of a stored object.
    pub fn get(&self, location: &ObjectLocation) -> Result<Option<(Vec<u8>, Option<ObjectMeta>)>, BackendError> {
        let path = self.object_path(location)?;
        let body = match std::fs::read(&path) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&path, err)),
        };
        Ok(Some((body, self.read_meta(location)?)))
    }

    fn read_meta(&self, location: &ObjectLocation) -> Result<Option<ObjectMeta>, BackendError> {
        let path = self.meta_path(location)?;
        match std::fs::read(&path) {
            // Unreadable metadata only disables hash gating.
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    fn prune_empty_parents(start: Option<&Path>, stop: &Path) {
        let mut current = start;
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(stop) {
                break;
            }
            if std::fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

/// Key components of `location`, rejecting anything that could escape the
/// bucket directory.
fn validate(location: &ObjectLocation) -> Result<Vec<&str>, BackendError> {
    let bucket = location.bucket.as_str();
    if bucket.is_empty() || bucket.starts_with('.') || bucket.contains(&['/', '\\', '\0'][..]) {
        return Err(BackendError::InvalidName {
            kind: "bucket",
            name: bucket.to_string(),
        });
    }
    let components: Vec<&str> = location.key.split('/').collect();
    let bad = location.key.contains(&['\\', '\0'][..])
        || components
            .iter()
            .any(|c| c.is_empty() || *c == "." || *c == "..");
    if bad {
        return Err(BackendError::InvalidName {
            kind: "object key",
            name: location.key.clone(),
        });
    }
    Ok(components)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.cody.tmp", path.display()));
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, err));
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool, BackendError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, location: &ObjectLocation, body: &[u8], content_type: &str) -> Result<(), BackendError> {
        let path = self.object_path(location)?;
        let digest = hex::encode(Sha256::digest(body));

        if let Some(meta) = self.read_meta(location)? {
            if meta.sha256 == digest && meta.content_type == content_type && path.exists() {
                tracing::debug!(location = %location, "unchanged");
                return Ok(());
            }
        }

        write_atomic(&path, body)?;
        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            sha256: digest,
            written_at: Utc::now(),
        };
        write_atomic(&self.meta_path(location)?, &serde_json::to_vec_pretty(&meta)?)?;
        Ok(())
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), BackendError> {
        let path = self.object_path(location)?;
        let meta = self.meta_path(location)?;
        let removed = remove_if_present(&path)?;
        remove_if_present(&meta)?;

        Self::prune_empty_parents(path.parent(), &self.root.join(&location.bucket));
        Self::prune_empty_parents(meta.parent(), &self.root.join(META_DIR).join(&location.bucket));
        if !removed {
            tracing::debug!(location = %location, "already absent");
        }
        Ok(())
    }
}
