//! Drain worker: one queued action per invocation.
//!
//! ## `handle` — protocol
//!
//! 1. Payload other than [`DRAIN_TRIGGER`] → nothing to do.
//! 2. Dequeue one message; queue empty → drain complete, no re-trigger.
//! 3. Action not part of the staged target → stale ([`StalePolicy`]).
//! 4. Path outside the content root → skip execution, still counted.
//! 5. PUT uploads the blob, DELETE removes the key (absent key is fine).
//! 6. Record completion of the action's sequence, guarded by commit + batch.
//!    Counter at zero → finalize, guarded by commit + batch + drained.
//! 7. Ack the message.
//! 8. Re-trigger the next invocation.

use cody_core::{
    control, ActionKind, BackendError, Condition, DestinationTemplate, ObjectLocation,
    PublishAction, StalePolicy, StatusUpdate, UpdateOutcome,
};

use crate::error::PublishError;
use crate::mime;
use crate::pipeline::Backends;

/// Notification payload that asks the worker to process one action.
pub const DRAIN_TRIGGER: &str = "run";

/// What one invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The payload was not a drain trigger.
    Ignored,
    /// No message was available.
    Idle,
    /// The action belonged to a superseded target and was not executed.
    Stale {
        action: PublishAction,
        /// Whether the message was deleted (and the drain re-triggered).
        acked: bool,
    },
    /// The action was handled and counted.
    Completed {
        action: PublishAction,
        /// `false` when the path lies outside the content root.
        executed: bool,
        /// Whether this invocation finalized the batch.
        finalized: bool,
    },
    /// The target moved on between execution and completion.
    RaceLost { action: PublishAction },
}

impl DrainOutcome {
    /// Whether the trampoline continues after this invocation.
    pub fn retriggers(&self) -> bool {
        match self {
            DrainOutcome::Ignored | DrainOutcome::Idle => false,
            DrainOutcome::Stale { acked, .. } => *acked,
            DrainOutcome::Completed { .. } | DrainOutcome::RaceLost { .. } => true,
        }
    }
}

pub struct DrainWorker {
    backends: Backends,
    destination: DestinationTemplate,
    stale_policy: StalePolicy,
}

impl DrainWorker {
    pub fn new(
        backends: Backends,
        destination: DestinationTemplate,
        stale_policy: StalePolicy,
    ) -> Self {
        Self {
            backends,
            destination,
            stale_policy,
        }
    }

    pub fn stale_policy(&self) -> StalePolicy {
        self.stale_policy
    }

    /// Handle one drain notification.
    pub fn handle(&self, payload: &str) -> Result<DrainOutcome, PublishError> {
        if payload.trim() != DRAIN_TRIGGER {
            tracing::debug!(payload, "ignoring notification");
            return Ok(DrainOutcome::Ignored);
        }

        let Some(delivery) = self.backends.queue.dequeue_one()? else {
            tracing::debug!("queue empty; drain complete");
            return Ok(DrainOutcome::Idle);
        };
        let action = delivery.action;
        let key = action.key();

        let record = self.backends.status.get_consistent(&key)?;
        let Some(record) = record.filter(|record| record.is_current(&action)) else {
            return self.discard_stale(&delivery.receipt, action);
        };

        let root = control::content_root(&record.new_config);
        let executed = match relative_to_root(&action.path, &root) {
            Some(relative) => {
                self.execute(&action, relative)?;
                true
            }
            None => {
                tracing::debug!(
                    key = %key,
                    path = %action.path,
                    root = %root,
                    "outside content root; counted without publishing"
                );
                false
            }
        };

        let completed = self.backends.status.conditional_update(
            &key,
            &StatusUpdate::CompleteAction {
                sequence: action.sequence,
            },
            &Condition::InFlight {
                commit_id: action.commit_id.clone(),
                batch: action.batch,
            },
        )?;
        let outcome = match completed {
            UpdateOutcome::ConditionFailed => {
                tracing::info!(
                    key = %key,
                    commit = %action.commit_id,
                    batch = action.batch,
                    path = %action.path,
                    "target moved on before completion; not counted"
                );
                DrainOutcome::RaceLost { action }
            }
            UpdateOutcome::Applied(record) => {
                let finalized = record.remaining_actions == 0 && self.finalize(&action)?;
                DrainOutcome::Completed {
                    action,
                    executed,
                    finalized,
                }
            }
        };

        self.backends.queue.ack(&delivery.receipt)?;
        self.backends.notifier.trigger()?;
        Ok(outcome)
    }

    fn discard_stale(
        &self,
        receipt: &str,
        action: PublishAction,
    ) -> Result<DrainOutcome, PublishError> {
        match self.stale_policy {
            StalePolicy::AckAndRetrigger => {
                tracing::info!(
                    key = %action.key(),
                    commit = %action.commit_id,
                    batch = action.batch,
                    path = %action.path,
                    "discarding stale action"
                );
                self.backends.queue.ack(receipt)?;
                self.backends.notifier.trigger()?;
                Ok(DrainOutcome::Stale {
                    action,
                    acked: true,
                })
            }
            StalePolicy::LeaveForRedelivery => {
                tracing::info!(
                    key = %action.key(),
                    commit = %action.commit_id,
                    batch = action.batch,
                    path = %action.path,
                    "stale action left for redelivery"
                );
                Ok(DrainOutcome::Stale {
                    action,
                    acked: false,
                })
            }
        }
    }

    fn execute(&self, action: &PublishAction, relative: &str) -> Result<(), PublishError> {
        let location = self
            .destination
            .resolve(&action.repository, &action.branch)
            .location(relative);

        match action.kind {
            ActionKind::Put => {
                let blob_id = action.blob_id.as_ref().ok_or_else(|| {
                    BackendError::NotFound(format!("blob id of PUT {}", action.path))
                })?;
                let body = self.backends.source.get_blob(&action.repository, blob_id)?;
                let content_type = mime::from_path(relative);
                self.backends.blobs.put(&location, &body, content_type)?;
                tracing::info!(location = %location, content_type, bytes = body.len(), "put");
            }
            ActionKind::Delete => {
                delete_idempotent(self.backends.blobs.as_ref(), &location)?;
                tracing::info!(location = %location, "delete");
            }
        }
        Ok(())
    }

    /// Copy the staged target to `published_*` if this batch is still the
    /// staged one and fully counted.
    fn finalize(&self, action: &PublishAction) -> Result<bool, PublishError> {
        let key = action.key();
        let outcome = self.backends.status.conditional_update(
            &key,
            &StatusUpdate::Finalize,
            &Condition::Drained {
                commit_id: action.commit_id.clone(),
                batch: action.batch,
            },
        )?;
        let finalized = outcome.applied().is_some();
        if finalized {
            tracing::info!(
                key = %key,
                commit = %action.commit_id,
                batch = action.batch,
                "commit fully published"
            );
        }
        Ok(finalized)
    }
}

fn delete_idempotent(
    blobs: &dyn cody_core::BlobStore,
    location: &ObjectLocation,
) -> Result<(), BackendError> {
    match blobs.delete(location) {
        Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

/// `path` with `root` stripped, or `None` when it lies outside the root or
/// names the root itself.
fn relative_to_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    let relative = path.strip_prefix(root)?;
    if relative.is_empty() {
        None
    } else {
        Some(relative)
    }
}
