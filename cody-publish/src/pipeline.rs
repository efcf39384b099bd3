//! Shared publish pipeline entrypoint used by CLI and daemon.

use std::path::Path;
use std::sync::Arc;

use cody_core::{
    config, ActionQueue, BlobStore, CommitId, DiffSource, FsStatusStore, Notifier,
    PublisherConfig, StatusKey, StatusStore,
};

use crate::drain::{DrainOutcome, DrainWorker, DRAIN_TRIGGER};
use crate::error::PublishError;
use crate::git::GitCliSource;
use crate::ingest::Ingestor;
use crate::memory::CountingNotifier;
use crate::queue::SpoolQueue;
use crate::target::FsBlobStore;

/// The five collaborators the pipeline talks to.
#[derive(Clone)]
pub struct Backends {
    pub source: Arc<dyn DiffSource>,
    pub status: Arc<dyn StatusStore>,
    pub queue: Arc<dyn ActionQueue>,
    pub notifier: Arc<dyn Notifier>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Backends {
    /// Filesystem-backed collaborators rooted at `home`, sharing state with
    /// every other process that uses the same home directory.
    pub fn durable(home: &Path, config: &PublisherConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            source: Arc::new(GitCliSource::new(config.repositories_root_at(home))),
            status: Arc::new(FsStatusStore::new(config::status_dir_at(home))),
            queue: Arc::new(SpoolQueue::new(
                config::queue_dir_at(home),
                config.queue.visibility_timeout(),
            )),
            notifier,
            blobs: Arc::new(FsBlobStore::new(config.target_root_at(home))),
        }
    }
}

/// Ingest stage and drain worker over one set of backends.
pub struct Publisher {
    pub ingestor: Ingestor,
    pub worker: DrainWorker,
}

impl Publisher {
    pub fn new(backends: Backends, config: &PublisherConfig) -> Self {
        Self {
            ingestor: Ingestor::new(backends.clone(), config.control_files.clone()),
            worker: DrainWorker::new(backends, config.destination.clone(), config.stale_actions),
        }
    }
}

// ---------------------------------------------------------------------------
// In-process trampoline
// ---------------------------------------------------------------------------

/// Summary of an in-process drain run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub invocations: usize,
    pub executed: usize,
    pub skipped: usize,
    pub stale: usize,
    pub race_lost: usize,
    /// Commits finalized during the run, in order.
    pub finalized: Vec<(StatusKey, CommitId)>,
    /// Stale messages left in the queue for redelivery.
    pub left_for_redelivery: usize,
}

impl DrainReport {
    pub fn record(&mut self, outcome: &DrainOutcome) {
        self.invocations += 1;
        match outcome {
            DrainOutcome::Ignored | DrainOutcome::Idle => {}
            DrainOutcome::Stale { acked, .. } => {
                self.stale += 1;
                if !acked {
                    self.left_for_redelivery += 1;
                }
            }
            DrainOutcome::RaceLost { .. } => self.race_lost += 1,
            DrainOutcome::Completed {
                action,
                executed,
                finalized,
            } => {
                if *executed {
                    self.executed += 1;
                } else {
                    self.skipped += 1;
                }
                if *finalized {
                    self.finalized.push((action.key(), action.commit_id.clone()));
                }
            }
        }
    }
}

/// Run the drain trampoline in-process: one [`DrainWorker::handle`] per
/// pending trigger on `notifier`, until no trigger is pending.
///
/// Stops at the first error; the failing message stays in the queue.
pub fn run_trampoline(
    worker: &DrainWorker,
    notifier: &CountingNotifier,
) -> Result<DrainReport, PublishError> {
    let mut report = DrainReport::default();
    while notifier.take_one() {
        let outcome = worker.handle(DRAIN_TRIGGER)?;
        report.record(&outcome);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackends;

    #[test]
    fn trampoline_without_trigger_does_nothing() {
        let memory = MemoryBackends::new();
        let publisher = Publisher::new(memory.backends(), &PublisherConfig::default());
        let report = run_trampoline(&publisher.worker, &memory.notifier).expect("drain");
        assert_eq!(report, DrainReport::default());
    }

    #[test]
    fn trampoline_consumes_final_idle_trigger() {
        let memory = MemoryBackends::new();
        let publisher = Publisher::new(memory.backends(), &PublisherConfig::default());
        memory.notifier.trigger().expect("trigger");
        let report = run_trampoline(&publisher.worker, &memory.notifier).expect("drain");
        assert_eq!(report.invocations, 1);
        assert_eq!(memory.notifier.pending(), 0);
    }
}
