//! `cody publish` — ingest a commit and drain until the target is idle.

use anyhow::{Context, Result};
use clap::Args;

use cody_core::Notifier;
use cody_publish::run_trampoline;

use super::{init_tracing, print_ingest, print_report, CommitArgs, Local};

#[derive(Args, Debug)]
pub struct PublishArgs {
    #[command(flatten)]
    pub commit: CommitArgs,
}

impl PublishArgs {
    pub fn run(self) -> Result<()> {
        init_tracing();
        let local = Local::open()?;
        let event = self.commit.event(&local)?;

        let outcome = local
            .publisher
            .ingestor
            .ingest_commit(&event)
            .with_context(|| format!("failed to ingest '{}'", event.key()))?;
        print_ingest(&event, &outcome);

        // Pick up anything left in the queue even when this commit needed no actions.
        if local.notifier.pending() == 0 {
            local.notifier.trigger().context("failed to trigger drain")?;
        }
        let report = run_trampoline(&local.publisher.worker, &local.notifier)
            .context("drain stopped on error; the failing action stays queued")?;
        print_report(&report);
        Ok(())
    }
}
