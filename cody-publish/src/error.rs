//! Error types for cody-publish.

use thiserror::Error;

use cody_core::{BackendError, ControlFileError};

/// All errors that can arise from ingesting a commit or draining an action.
#[derive(Debug, Error)]
pub enum PublishError {
    /// A collaborator failed (diff source, status store, queue, notifier,
    /// blob store).
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A control file of the ingested commit could not be parsed.
    #[error("control file {path}: {source}")]
    ControlFile {
        path: String,
        #[source]
        source: ControlFileError,
    },

    /// The filtered diff has more entries than a batch counter can hold.
    #[error("commit produces {0} actions, more than one batch can track")]
    BatchTooLarge(usize),
}

impl PublishError {
    /// Whether retrying the same work later may succeed.
    ///
    /// A malformed control file stays malformed for that commit.
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Backend(_))
    }
}
