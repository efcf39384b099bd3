//! Domain types for the publish pipeline.
//!
//! Repository paths inside a commit are `/`-separated strings relative to the
//! repository root; they are never local filesystem paths.
//! All types are serializable/deserializable via serde.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a source repository.
    RepositoryName
);
string_newtype!(
    /// Name of a branch inside a repository.
    BranchName
);
string_newtype!(
    /// Opaque, immutable commit identifier.
    CommitId
);
string_newtype!(
    /// Opaque content identifier of a file revision.
    BlobId
);

/// Identity of a [`PublishTarget`] record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatusKey {
    pub repository: RepositoryName,
    pub branch: BranchName,
}

impl StatusKey {
    pub fn new(repository: impl Into<RepositoryName>, branch: impl Into<BranchName>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
        }
    }
}

/// `repository + "/" + branch`
impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.branch)
    }
}

/// Site configuration read from the repository's config file.
pub type SiteConfig = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Diff entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    AddedOrModified,
    Deleted,
}

/// One side of a diff entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub path: String,
    pub blob_id: BlobId,
}

/// A single path-level change between two commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<BlobRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<BlobRef>,
}

impl DiffEntry {
    pub fn added(path: impl Into<String>, blob_id: impl Into<BlobId>) -> Self {
        Self {
            kind: ChangeKind::AddedOrModified,
            before: None,
            after: Some(BlobRef {
                path: path.into(),
                blob_id: blob_id.into(),
            }),
        }
    }

    pub fn modified(
        path: impl Into<String>,
        before: impl Into<BlobId>,
        after: impl Into<BlobId>,
    ) -> Self {
        let path = path.into();
        Self {
            kind: ChangeKind::AddedOrModified,
            before: Some(BlobRef {
                path: path.clone(),
                blob_id: before.into(),
            }),
            after: Some(BlobRef {
                path,
                blob_id: after.into(),
            }),
        }
    }

    pub fn deleted(path: impl Into<String>, blob_id: impl Into<BlobId>) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            before: Some(BlobRef {
                path: path.into(),
                blob_id: blob_id.into(),
            }),
            after: None,
        }
    }

    /// The path this entry publishes to: the before-path for deletions, the
    /// after-path otherwise.
    pub fn path(&self) -> Option<&str> {
        let side = match self.kind {
            ChangeKind::Deleted => self.before.as_ref().or(self.after.as_ref()),
            ChangeKind::AddedOrModified => self.after.as_ref().or(self.before.as_ref()),
        };
        side.map(|blob| blob.path.as_str())
    }

    /// Every path mentioned by the entry (before and after).
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.before
            .iter()
            .chain(self.after.iter())
            .map(|blob| blob.path.as_str())
    }
}

// ---------------------------------------------------------------------------
// Publish actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    Put,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Put => write!(f, "PUT"),
            ActionKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// A commit event delivered to the ingest stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEvent {
    pub repository: RepositoryName,
    pub branch: BranchName,
    pub commit_id: CommitId,
}

impl CommitEvent {
    pub fn new(
        repository: impl Into<RepositoryName>,
        branch: impl Into<BranchName>,
        commit_id: impl Into<CommitId>,
    ) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            commit_id: commit_id.into(),
        }
    }

    pub fn key(&self) -> StatusKey {
        StatusKey::new(self.repository.clone(), self.branch.clone())
    }
}

/// Queue message describing one file to publish or remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAction {
    pub repository: RepositoryName,
    pub branch: BranchName,
    pub commit_id: CommitId,
    /// Staging generation of the target this action belongs to.
    pub batch: u64,
    /// Position in the batch; completion is counted once per sequence.
    pub sequence: u32,
    pub kind: ActionKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<BlobId>,
}

impl PublishAction {
    /// Build the action for a diff entry. Returns `None` for an entry that
    /// names no path at all.
    pub fn from_entry(
        event: &CommitEvent,
        batch: u64,
        sequence: u32,
        entry: &DiffEntry,
    ) -> Option<Self> {
        let (kind, blob) = match entry.kind {
            ChangeKind::Deleted => (ActionKind::Delete, entry.before.as_ref()?),
            ChangeKind::AddedOrModified => (ActionKind::Put, entry.after.as_ref()?),
        };
        Some(Self {
            repository: event.repository.clone(),
            branch: event.branch.clone(),
            commit_id: event.commit_id.clone(),
            batch,
            sequence,
            kind,
            path: blob.path.clone(),
            blob_id: match kind {
                ActionKind::Put => Some(blob.blob_id.clone()),
                ActionKind::Delete => None,
            },
        })
    }

    pub fn key(&self) -> StatusKey {
        StatusKey::new(self.repository.clone(), self.branch.clone())
    }
}

// ---------------------------------------------------------------------------
// Publish target record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
    Idle,
    Publishing,
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishState::Idle => write!(f, "idle"),
            PublishState::Publishing => write!(f, "publishing"),
        }
    }
}

/// The persisted publish status of one repository/branch.
///
/// `remaining_actions > 0` means PUBLISHING and the `new_*` fields are the
/// authoritative target; otherwise only the `published_*` fields are.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublishTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_commit_id: Option<CommitId>,
    #[serde(default)]
    pub published_ignore_patterns: Vec<String>,
    #[serde(default)]
    pub published_config: SiteConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_commit_id: Option<CommitId>,
    #[serde(default)]
    pub new_ignore_patterns: Vec<String>,
    #[serde(default)]
    pub new_config: SiteConfig,
    #[serde(default)]
    pub remaining_actions: u32,
    #[serde(default)]
    pub batch: u64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub completed_actions: BTreeSet<u32>,
    /// Commits staged and replaced since the last publish, oldest first.
    /// Their batches may have written paths the current commit must revisit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded_commit_ids: Vec<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PublishTarget {
    pub fn state(&self) -> PublishState {
        if self.remaining_actions > 0 {
            PublishState::Publishing
        } else {
            PublishState::Idle
        }
    }

    /// The commit currently being drained, if any.
    pub fn in_flight(&self) -> Option<&CommitId> {
        match self.state() {
            PublishState::Publishing => self.new_commit_id.as_ref(),
            PublishState::Idle => None,
        }
    }

    /// Whether `commit_id`/`batch` name the staged target.
    ///
    /// Holds while the batch is draining and also once its counter reached
    /// zero but before finalization copied it to `published_*`.
    pub fn is_staged(&self, commit_id: &CommitId, batch: u64) -> bool {
        self.new_commit_id.as_ref() == Some(commit_id) && self.batch == batch
    }

    /// Every commit whose batch may have touched the target since the last
    /// publish: the superseded ones, then the staged one.
    pub fn unpublished_commits(&self) -> impl Iterator<Item = &CommitId> {
        self.superseded_commit_ids.iter().chain(self.new_commit_id.iter())
    }

    /// Whether `action` belongs to the staged target.
    pub fn is_current(&self, action: &PublishAction) -> bool {
        self.is_staged(&action.commit_id, action.batch)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
