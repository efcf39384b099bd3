//! Cody — commit-driven repository publisher CLI.
//!
//! # Usage
//!
//! ```text
//! cody publish <repository> [--branch main] [--commit <id>]
//! cody ingest <repository> [--branch main] [--commit <id>]
//! cody drain [--once]
//! cody status [<repository>] [--json]
//! cody daemon start|stop|status|submit
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, drain::DrainArgs, ingest::IngestArgs, publish::PublishArgs,
    status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "cody",
    version,
    about = "Publish git repository content to a target store, commit by commit",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a commit and drain its actions until the target is idle.
    Publish(PublishArgs),

    /// Ingest a commit: stage its publish target and queue its actions.
    Ingest(IngestArgs),

    /// Run the drain trampoline in-process.
    Drain(DrainArgs),

    /// Show publish targets.
    Status(StatusArgs),

    /// Run or talk to the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Publish(args) => args.run(),
        Commands::Ingest(args) => args.run(),
        Commands::Drain(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
