//! # cody-publish
//!
//! Ingest stage, drain worker and the collaborators they run against.
//!
//! Call [`Ingestor::ingest_commit`] when a commit lands, then let the
//! notifier drive [`DrainWorker::handle`] until the queue is empty
//! ([`run_trampoline`] does that in-process).

pub mod drain;
pub mod error;
pub mod git;
pub mod ingest;
pub mod memory;
pub mod mime;
pub mod pipeline;
pub mod queue;
pub mod target;

pub use drain::{DrainOutcome, DrainWorker, DRAIN_TRIGGER};
pub use error::PublishError;
pub use git::GitCliSource;
pub use ingest::{IngestOutcome, Ingestor};
pub use memory::{CountingNotifier, MemoryBackends, MemoryBlobStore, MemoryQueue, MemoryRepository};
pub use pipeline::{run_trampoline, Backends, DrainReport, Publisher};
pub use queue::SpoolQueue;
pub use target::FsBlobStore;
