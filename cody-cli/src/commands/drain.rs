//! `cody drain` — run the drain worker in-process.

use anyhow::{Context, Result};
use clap::Args;

use cody_core::Notifier;
use cody_publish::{run_trampoline, DrainOutcome, DRAIN_TRIGGER};

use super::{init_tracing, print_report, short, Local};

#[derive(Args, Debug)]
pub struct DrainArgs {
    /// Handle a single action instead of draining until idle.
    #[arg(long)]
    pub once: bool,
}

impl DrainArgs {
    pub fn run(self) -> Result<()> {
        init_tracing();
        let local = Local::open()?;

        if self.once {
            let outcome = local
                .publisher
                .worker
                .handle(DRAIN_TRIGGER)
                .context("drain invocation failed")?;
            print_outcome(&outcome);
            return Ok(());
        }

        local.notifier.trigger().context("failed to trigger drain")?;
        let report = run_trampoline(&local.publisher.worker, &local.notifier)
            .context("drain stopped on error; the failing action stays queued")?;
        print_report(&report);
        Ok(())
    }
}

fn print_outcome(outcome: &DrainOutcome) {
    match outcome {
        DrainOutcome::Ignored | DrainOutcome::Idle => println!("queue is empty"),
        DrainOutcome::Stale { action, acked } => println!(
            "stale {} '{}' of {} ({})",
            action.kind,
            action.path,
            short(&action.commit_id),
            if *acked { "dropped" } else { "left for redelivery" }
        ),
        DrainOutcome::Completed {
            action,
            executed,
            finalized,
        } => {
            let verb = if *executed { "published" } else { "skipped" };
            println!("{verb} {} '{}'", action.kind, action.path);
            if *finalized {
                println!("  ✓  '{}' now at {}", action.key(), short(&action.commit_id));
            }
        }
        DrainOutcome::RaceLost { action } => println!(
            "'{}' moved on while {} '{}' ran",
            action.key(),
            action.kind,
            action.path
        ),
    }
}
