//! `cody daemon` — background publisher lifecycle and commit submission.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::Value;

use cody_daemon::paths::socket_path;
use cody_daemon::{
    request_commit, request_drain, request_status, request_stop, start_blocking, DaemonError,
};

use super::CommitArgs;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (ingest, drain and socket server).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
    /// Submit a commit event to the running daemon.
    Submit(CommitArgs),
    /// Ask the running daemon to start a drain.
    Drain,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = cody_core::config::home().context("could not determine home directory")?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(&home) {
            Ok(status) => print_json(&status)?,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                print_json(&serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }))?;
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
        DaemonCommand::Submit(args) => {
            let summary = request_commit(
                &home,
                &args.repository,
                Some(args.branch.as_str()),
                args.commit.as_deref(),
            )
            .with_context(|| format!("daemon rejected commit for '{}'", args.repository))?;
            print_json(&summary)?;
        }
        DaemonCommand::Drain => {
            let response = request_drain(&home).context("failed to trigger daemon drain")?;
            print_json(&response)?;
        }
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render daemon JSON")?
    );
    Ok(())
}
