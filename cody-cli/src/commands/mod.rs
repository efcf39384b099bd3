//! Subcommands and the pieces they share.

pub mod daemon;
pub mod drain;
pub mod ingest;
pub mod publish;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use cody_core::{config, BranchName, CommitEvent, CommitId, PublisherConfig, RepositoryName};
use cody_publish::{Backends, CountingNotifier, DrainReport, GitCliSource, IngestOutcome, Publisher};

/// `<repository> [--branch] [--commit]`, shared by every command that names
/// a commit.
#[derive(Args, Debug, Clone)]
pub struct CommitArgs {
    /// Repository name (a git repository under the repositories root).
    pub repository: String,

    /// Branch the commit belongs to.
    #[arg(long, short = 'b', default_value = "main")]
    pub branch: String,

    /// Commit id; defaults to the current head of the branch.
    #[arg(long, short = 'c')]
    pub commit: Option<String>,
}

impl CommitArgs {
    /// The commit event these arguments name, resolving the branch head when
    /// no commit was given.
    pub fn event(&self, local: &Local) -> Result<CommitEvent> {
        let repository = RepositoryName::from(self.repository.as_str());
        let branch = BranchName::from(self.branch.as_str());
        let commit_id = match &self.commit {
            Some(commit) => CommitId::from(commit.as_str()),
            None => GitCliSource::new(local.config.repositories_root_at(&local.home))
                .resolve_branch(&repository, &branch)
                .with_context(|| format!("could not resolve head of '{repository}/{branch}'"))?,
        };
        Ok(CommitEvent {
            repository,
            branch,
            commit_id,
        })
    }
}

/// Durable backends under the user's home, with an in-process notifier.
pub struct Local {
    pub home: PathBuf,
    pub config: PublisherConfig,
    pub notifier: Arc<CountingNotifier>,
    pub publisher: Publisher,
}

impl Local {
    pub fn open() -> Result<Self> {
        let home = config::home().context("could not determine home directory")?;
        Self::open_at(home)
    }

    pub fn open_at(home: PathBuf) -> Result<Self> {
        let config = config::load_at(&home)
            .with_context(|| format!("failed to load {}", config::config_path_at(&home).display()))?;
        let notifier = Arc::new(CountingNotifier::new());
        let backends = Backends::durable(&home, &config, notifier.clone());
        let publisher = Publisher::new(backends, &config);
        Ok(Self {
            home,
            config,
            notifier,
            publisher,
        })
    }
}

/// Log to stderr, `RUST_LOG` filter, default `info`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// First 12 characters of a commit id.
pub fn short(commit: &CommitId) -> &str {
    let id = commit.as_str();
    id.get(..12).unwrap_or(id)
}

pub fn print_ingest(event: &CommitEvent, outcome: &IngestOutcome) {
    let superseded = match outcome {
        IngestOutcome::Published { superseded, .. } | IngestOutcome::Staged { superseded, .. } => {
            superseded.as_ref()
        }
    };
    match outcome {
        IngestOutcome::Published { commit_id, .. } => println!(
            "✓ '{}/{}' {}: nothing to publish, recorded as published",
            event.repository,
            event.branch,
            short(commit_id)
        ),
        IngestOutcome::Staged {
            commit_id,
            batch,
            actions,
            ..
        } => println!(
            "✓ '{}/{}' {} staged (batch {batch}, {actions} actions)",
            event.repository,
            event.branch,
            short(commit_id)
        ),
    }
    if let Some(previous) = superseded {
        println!("  ↷  superseded {}", short(previous));
    }
}

pub fn print_report(report: &DrainReport) {
    println!(
        "drained: {} invocations, {} published, {} skipped, {} stale, {} lost races",
        report.invocations, report.executed, report.skipped, report.stale, report.race_lost
    );
    if report.left_for_redelivery > 0 {
        println!(
            "  ·  {} stale actions left for redelivery",
            report.left_for_redelivery
        );
    }
    for (key, commit) in &report.finalized {
        println!("  ✓  '{key}' now at {}", short(commit));
    }
}
