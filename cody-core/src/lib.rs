//! Cody core library — publish data model, status transitions, control files,
//! collaborator traits and configuration.
//!
//! - [`types`] — newtypes, diff entries, publish actions, the publish target record
//! - [`status`] — conditional status updates shared by every [`StatusStore`]
//! - [`control`] — ignore-pattern and site-config control files
//! - [`backend`] — collaborator traits ([`DiffSource`], [`StatusStore`], ...)
//! - [`status_store`] — in-memory and filesystem status stores
//! - [`config`] — publisher configuration (`~/.cody/config.yaml`)

pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod status;
pub mod status_store;
pub mod types;

pub use backend::{ActionQueue, BlobStore, Delivery, DiffSource, Notifier, ObjectLocation, StatusStore};
pub use config::{ControlFiles, Destination, DestinationTemplate, PublisherConfig, StalePolicy};
pub use error::{BackendError, ConfigError, ControlFileError};
pub use status::{Condition, StatusUpdate, UpdateOutcome};
pub use status_store::{FsStatusStore, MemoryStatusStore};
pub use types::{
    ActionKind, BlobId, BlobRef, BranchName, ChangeKind, CommitEvent, CommitId, DiffEntry,
    PublishAction, PublishState, PublishTarget, RepositoryName, SiteConfig, StatusKey,
};
