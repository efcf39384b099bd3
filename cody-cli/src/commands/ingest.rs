//! `cody ingest` — stage a commit without draining.

use anyhow::{Context, Result};
use clap::Args;

use super::{init_tracing, print_ingest, CommitArgs, Local};

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[command(flatten)]
    pub commit: CommitArgs,
}

impl IngestArgs {
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
        if outcome.action_count() > 0 {
            println!("Run 'cody drain' (or start the daemon) to publish queued actions.");
        }
        Ok(())
    }
}
