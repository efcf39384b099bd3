//! Ingest stage: commit event → publish target + queued actions.
//!
//! ## `ingest_commit` — protocol
//!
//! 1. Read the publish target (missing = idle, empty ignore list/config).
//! 2. Diff `published_commit_id → commit`. For every commit staged since the
//!    last publish (superseded ones and the one still staged), also diff
//!    `staged → commit` and merge it in (by path, primary first).
//! 3. Re-read the control files touched by the diff.
//! 4. Drop every entry with an ignored before- or after-path.
//! 5. Nothing left → advance `published_*` directly and stop.
//! 6. Stage the new target (`batch + 1`, counter = action count).
//! 7. Enqueue one action per surviving entry, in diff order.
//! 8. Kick the drain worker.
//!
//! Failures abort the commit; actions enqueued before the failure stay queued.

use std::collections::HashSet;

use cody_core::{
    control::{self, IgnoreMatcher},
    BackendError, ChangeKind, CommitEvent, CommitId, Condition, ControlFiles, DiffEntry,
    DiffSource, PublishAction, PublishTarget, SiteConfig, StatusUpdate, UpdateOutcome,
};

use crate::error::PublishError;
use crate::pipeline::Backends;

// ---------------------------------------------------------------------------
// Ingest outcome
// ---------------------------------------------------------------------------

/// What ingesting one commit did to its publish target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The filtered diff was empty; `published_*` now names the commit.
    Published {
        commit_id: CommitId,
        /// The staged commit this one replaced, if any.
        superseded: Option<CommitId>,
    },
    /// A new batch was staged and its actions enqueued.
    Staged {
        commit_id: CommitId,
        batch: u64,
        actions: u32,
        superseded: Option<CommitId>,
    },
}

impl IngestOutcome {
    pub fn commit_id(&self) -> &CommitId {
        match self {
            IngestOutcome::Published { commit_id, .. } | IngestOutcome::Staged { commit_id, .. } => {
                commit_id
            }
        }
    }

    pub fn action_count(&self) -> u32 {
        match self {
            IngestOutcome::Published { .. } => 0,
            IngestOutcome::Staged { actions, .. } => *actions,
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

pub struct Ingestor {
    backends: Backends,
    control_files: ControlFiles,
}

impl Ingestor {
    pub fn new(backends: Backends, control_files: ControlFiles) -> Self {
        Self {
            backends,
            control_files,
        }
    }

    /// Ingest a batch of commit events strictly in order.
    ///
    /// The first failure stops the batch; later events are not attempted.
    pub fn ingest_batch(&self, events: &[CommitEvent]) -> Result<Vec<IngestOutcome>, PublishError> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            outcomes.push(self.ingest_commit(event)?);
        }
        Ok(outcomes)
    }

    /// Ingest a single commit event.
    pub fn ingest_commit(&self, event: &CommitEvent) -> Result<IngestOutcome, PublishError> {
        let key = event.key();
        let record = self.backends.status.get_consistent(&key)?.unwrap_or_default();
        // Set until finalized, even once the counter reached zero.
        let superseded = record.new_commit_id.clone();

        let diff = self.collect_diff(event, &record)?;
        let (ignore_patterns, config) = self.read_control_files(event, &record, &diff)?;
        let matcher = IgnoreMatcher::new(&ignore_patterns).map_err(|source| {
            PublishError::ControlFile {
                path: self.control_files.ignore_file.clone(),
                source,
            }
        })?;

        // Batch ids are assigned once the target is staged.
        let mut actions: Vec<PublishAction> = diff
            .iter()
            .filter(|entry| !entry.paths().any(|path| matcher.is_ignored(path)))
            .filter_map(|entry| PublishAction::from_entry(event, 0, 0, entry))
            .collect();
        for (sequence, action) in actions.iter_mut().enumerate() {
            action.sequence = u32::try_from(sequence)
                .map_err(|_| PublishError::BatchTooLarge(sequence))?;
        }

        tracing::debug!(
            repository = %event.repository,
            branch = %event.branch,
            commit = %event.commit_id,
            changed = diff.len(),
            publishable = actions.len(),
            "diff filtered"
        );

        if actions.is_empty() {
            self.backends.status.conditional_update(
                &key,
                &StatusUpdate::Publish {
                    commit_id: event.commit_id.clone(),
                    ignore_patterns,
                    config,
                },
                &Condition::Always,
            )?;
            tracing::info!(
                repository = %event.repository,
                branch = %event.branch,
                commit = %event.commit_id,
                "nothing to publish; commit recorded as published"
            );
            return Ok(IngestOutcome::Published {
                commit_id: event.commit_id.clone(),
                superseded,
            });
        }

        let count = u32::try_from(actions.len())
            .map_err(|_| PublishError::BatchTooLarge(actions.len()))?;
        let staged = self.backends.status.conditional_update(
            &key,
            &StatusUpdate::Stage {
                commit_id: event.commit_id.clone(),
                ignore_patterns,
                config,
                action_count: count,
            },
            &Condition::Always,
        )?;
        let batch = match staged {
            UpdateOutcome::Applied(record) => record.batch,
            // An unconditional update always applies; treat anything else as
            // a store fault.
            UpdateOutcome::ConditionFailed => {
                return Err(BackendError::Unavailable {
                    service: "status store",
                    message: format!("unconditional stage of {key} was rejected"),
                }
                .into())
            }
        };

        for action in &mut actions {
            action.batch = batch;
            self.backends.queue.enqueue(action)?;
        }
        self.backends.notifier.trigger()?;

        tracing::info!(
            repository = %event.repository,
            branch = %event.branch,
            commit = %event.commit_id,
            batch,
            actions = count,
            superseded = ?superseded.as_ref().map(CommitId::as_str),
            "publish target staged"
        );
        Ok(IngestOutcome::Staged {
            commit_id: event.commit_id.clone(),
            batch,
            actions: count,
            superseded,
        })
    }

    /// `published → commit`, merged with `staged → commit` for every other
    /// commit staged since the last publish.
    fn collect_diff(
        &self,
        event: &CommitEvent,
        record: &PublishTarget,
    ) -> Result<Vec<DiffEntry>, PublishError> {
        let source: &dyn DiffSource = self.backends.source.as_ref();
        let mut diff = source.diff(
            &event.repository,
            record.published_commit_id.as_ref(),
            &event.commit_id,
        )?;

        let mut seen: HashSet<String> = diff
            .iter()
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();
        let mut visited: HashSet<&CommitId> = HashSet::from([&event.commit_id]);
        for staged in record.unpublished_commits() {
            if !visited.insert(staged) {
                continue;
            }
            for entry in source.diff(&event.repository, Some(staged), &event.commit_id)? {
                let Some(path) = entry.path() else { continue };
                if seen.insert(path.to_string()) {
                    diff.push(entry);
                }
            }
        }
        Ok(diff)
    }

    /// Starting from the record's published control values, apply every
    /// control-file change in `diff`.
    fn read_control_files(
        &self,
        event: &CommitEvent,
        record: &PublishTarget,
        diff: &[DiffEntry],
    ) -> Result<(Vec<String>, SiteConfig), PublishError> {
        let mut ignore_patterns = record.published_ignore_patterns.clone();
        let mut config = record.published_config.clone();

        for entry in diff {
            let Some(path) = entry.path() else { continue };
            let is_ignore_file = path == self.control_files.ignore_file;
            let is_site_config = path == self.control_files.site_config_file;
            if !is_ignore_file && !is_site_config {
                continue;
            }

            let bytes = match (entry.kind, entry.after.as_ref()) {
                (ChangeKind::AddedOrModified, Some(after)) => {
                    Some(self.backends.source.get_blob(&event.repository, &after.blob_id)?)
                }
                _ => None,
            };
            let control_err = |source| PublishError::ControlFile {
                path: path.to_string(),
                source,
            };

            if is_ignore_file {
                ignore_patterns = match bytes {
                    Some(bytes) => control::parse_ignore_file(&bytes).map_err(control_err)?,
                    None => Vec::new(),
                };
            } else {
                config = match bytes {
                    Some(bytes) => control::parse_site_config(&bytes).map_err(control_err)?,
                    None => SiteConfig::new(),
                };
            }
        }
        Ok((ignore_patterns, config))
    }
}
