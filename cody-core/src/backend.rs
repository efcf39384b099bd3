//! Collaborator traits.
//!
//! The pipeline only talks to the outside world through these five seams.
//! Implementations decide their own retry policy; the pipeline never retries.

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::status::{Condition, StatusUpdate, UpdateOutcome};
use crate::types::{BlobId, CommitId, DiffEntry, PublishAction, PublishTarget, RepositoryName, StatusKey};

/// Source repository: commit diffs and blob contents.
pub trait DiffSource: Send + Sync {
    /// Changes between `from` and `to`. `from == None` diffs against the
    /// empty tree (every file of `to` is added).
    fn diff(
        &self,
        repository: &RepositoryName,
        from: Option<&CommitId>,
        to: &CommitId,
    ) -> Result<Vec<DiffEntry>, BackendError>;

    fn get_blob(&self, repository: &RepositoryName, blob_id: &BlobId)
        -> Result<Vec<u8>, BackendError>;
}

/// Strongly consistent, conditionally updatable store of publish targets.
pub trait StatusStore: Send + Sync {
    fn get_consistent(&self, key: &StatusKey) -> Result<Option<PublishTarget>, BackendError>;

    /// Atomically apply `update` if `condition` holds for the current record.
    fn conditional_update(
        &self,
        key: &StatusKey,
        update: &StatusUpdate,
        condition: &Condition,
    ) -> Result<UpdateOutcome, BackendError>;

    /// Every stored record, sorted by key.
    fn list(&self) -> Result<Vec<(StatusKey, PublishTarget)>, BackendError>;
}

/// A dequeued message. It stays invisible to other consumers until acked or
/// until the queue's visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: String,
    pub action: PublishAction,
}

/// Durable, at-least-once, best-effort FIFO queue of publish actions.
pub trait ActionQueue: Send + Sync {
    fn enqueue(&self, action: &PublishAction) -> Result<(), BackendError>;

    fn dequeue_one(&self) -> Result<Option<Delivery>, BackendError>;

    /// Delete a handled message.
    fn ack(&self, receipt: &str) -> Result<(), BackendError>;
}

/// Fire-and-forget trigger of the drain worker.
pub trait Notifier: Send + Sync {
    fn trigger(&self) -> Result<(), BackendError>;
}

/// Where a published object lives in the target store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.bucket, self.key)
    }
}

/// Destination object store.
pub trait BlobStore: Send + Sync {
    fn put(
        &self,
        location: &ObjectLocation,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), BackendError>;

    /// Delete an object. Deleting an absent object succeeds.
    fn delete(&self, location: &ObjectLocation) -> Result<(), BackendError>;
}
