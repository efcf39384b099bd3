//! Conditional status updates.
//!
//! Every [`StatusStore`](crate::StatusStore) implementation evaluates a
//! [`Condition`] against the current record and, when it holds, applies a
//! [`StatusUpdate`] through [`PublishTarget::apply`] as one atomic step. The
//! transition rules therefore live here, not in the stores.
//!
//! | update | written by | effect |
//! |---|---|---|
//! | `Stage` | ingest | new target, `batch + 1`, counter = action count, replaced commit remembered |
//! | `Publish` | ingest (empty diff) | `published_*` set directly, in-flight target cleared |
//! | `CompleteAction` | drain | sequence recorded, counter decremented once |
//! | `Finalize` | drain | `new_*` copied to `published_*`, target cleared |

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{CommitId, PublishTarget, SiteConfig};

/// A single-key mutation of a [`PublishTarget`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum StatusUpdate {
    Stage {
        commit_id: CommitId,
        ignore_patterns: Vec<String>,
        config: SiteConfig,
        action_count: u32,
    },
    Publish {
        commit_id: CommitId,
        ignore_patterns: Vec<String>,
        config: SiteConfig,
    },
    CompleteAction {
        sequence: u32,
    },
    Finalize,
}

/// Predicate a conditional update is guarded by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    Always,
    /// The staged target is still `commit_id` at `batch`.
    InFlight { commit_id: CommitId, batch: u64 },
    /// As `InFlight`, and every action of the batch has been counted.
    Drained { commit_id: CommitId, batch: u64 },
}

impl Condition {
    /// Evaluate against the stored record; a missing record behaves like
    /// [`PublishTarget::default`].
    pub fn holds(&self, record: Option<&PublishTarget>) -> bool {
        let empty = PublishTarget::default();
        let record = record.unwrap_or(&empty);
        match self {
            Condition::Always => true,
            Condition::InFlight { commit_id, batch } => record.is_staged(commit_id, *batch),
            Condition::Drained { commit_id, batch } => {
                record.is_staged(commit_id, *batch) && record.remaining_actions == 0
            }
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The condition held; carries the record as written.
    Applied(PublishTarget),
    ConditionFailed,
}

impl UpdateOutcome {
    pub fn applied(&self) -> Option<&PublishTarget> {
        match self {
            UpdateOutcome::Applied(record) => Some(record),
            UpdateOutcome::ConditionFailed => None,
        }
    }
}

impl PublishTarget {
    /// Apply `update` in place. Callers check the guarding [`Condition`] first.
    pub fn apply(&mut self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Stage {
                commit_id,
                ignore_patterns,
                config,
                action_count,
            } => {
                if let Some(previous) = self.new_commit_id.take() {
                    if previous != *commit_id && !self.superseded_commit_ids.contains(&previous) {
                        self.superseded_commit_ids.push(previous);
                    }
                }
                self.new_commit_id = Some(commit_id.clone());
                self.new_ignore_patterns = ignore_patterns.clone();
                self.new_config = config.clone();
                self.remaining_actions = *action_count;
                self.batch += 1;
                self.completed_actions = BTreeSet::new();
            }
            StatusUpdate::Publish {
                commit_id,
                ignore_patterns,
                config,
            } => {
                self.published_commit_id = Some(commit_id.clone());
                self.published_ignore_patterns = ignore_patterns.clone();
                self.published_config = config.clone();
                self.clear_in_flight();
            }
            StatusUpdate::CompleteAction { sequence } => {
                if self.completed_actions.insert(*sequence) {
                    self.remaining_actions = self.remaining_actions.saturating_sub(1);
                }
            }
            StatusUpdate::Finalize => {
                self.published_commit_id = self.new_commit_id.take();
                self.published_ignore_patterns = std::mem::take(&mut self.new_ignore_patterns);
                self.published_config = std::mem::take(&mut self.new_config);
                self.clear_in_flight();
            }
        }
        self.updated_at = Some(Utc::now());
    }

    fn clear_in_flight(&mut self) {
        self.new_commit_id = None;
        self.new_ignore_patterns.clear();
        self.new_config.clear();
        self.remaining_actions = 0;
        self.completed_actions.clear();
        self.superseded_commit_ids.clear();
    }
}

/// Evaluate `condition` and apply `update` to `record`, creating the record
/// when absent. The building block of every store's `conditional_update`.
pub fn apply_conditional(
    record: Option<PublishTarget>,
    update: &StatusUpdate,
    condition: &Condition,
) -> UpdateOutcome {
    if !condition.holds(record.as_ref()) {
        return UpdateOutcome::ConditionFailed;
    }
    let mut record = record.unwrap_or_default();
    record.apply(update);
    UpdateOutcome::Applied(record)
}
