//! `cody status` — publish target visibility.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use cody_core::{config, FsStatusStore, PublishState, PublishTarget, StatusKey, StatusStore};

use super::short;

/// Arguments for `cody status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only show targets of this repository.
    pub repository: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = config::home().context("could not determine home directory")?;
        let store = FsStatusStore::new(config::status_dir_at(&home));

        let mut targets = store.list().context("failed to read publish status")?;
        if let Some(repository) = self.repository.as_ref() {
            targets.retain(|(key, _)| key.repository.as_str() == repository);
        }

        if self.json {
            print_json(&targets)
        } else {
            print_table(&targets);
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct TargetJson<'a> {
    repository: &'a str,
    branch: &'a str,
    state: PublishState,
    published_commit: Option<&'a str>,
    new_commit: Option<&'a str>,
    remaining_actions: u32,
    batch: u64,
    updated_at: Option<String>,
}

#[derive(Tabled)]
struct TargetRow {
    #[tabled(rename = "repository")]
    repository: String,
    #[tabled(rename = "branch")]
    branch: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "published")]
    published: String,
    #[tabled(rename = "publishing")]
    publishing: String,
    #[tabled(rename = "remaining")]
    remaining: u32,
    #[tabled(rename = "updated")]
    updated: String,
}

fn print_json(targets: &[(StatusKey, PublishTarget)]) -> Result<()> {
    let payload: Vec<TargetJson<'_>> = targets
        .iter()
        .map(|(key, record)| TargetJson {
            repository: key.repository.as_str(),
            branch: key.branch.as_str(),
            state: record.state(),
            published_commit: record.published_commit_id.as_ref().map(|c| c.as_str()),
            new_commit: record.in_flight().map(|c| c.as_str()),
            remaining_actions: record.remaining_actions,
            batch: record.batch,
            updated_at: record.updated_at.map(|t| t.to_rfc3339()),
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(targets: &[(StatusKey, PublishTarget)]) {
    let publishing = targets
        .iter()
        .filter(|(_, record)| record.state() == PublishState::Publishing)
        .count();
    println!(
        "Cody v{} | {} targets | {} publishing",
        env!("CARGO_PKG_VERSION"),
        targets.len(),
        publishing,
    );

    if targets.is_empty() {
        println!("No publish targets yet.");
        return;
    }

    let rows: Vec<TargetRow> = targets
        .iter()
        .map(|(key, record)| TargetRow {
            repository: key.repository.to_string(),
            branch: key.branch.to_string(),
            state: state_label(record.state()),
            published: record
                .published_commit_id
                .as_ref()
                .map(|c| short(c).to_string())
                .unwrap_or_else(|| "never".to_string()),
            publishing: record
                .in_flight()
                .map(|c| short(c).to_string())
                .unwrap_or_else(|| "-".to_string()),
            remaining: record.remaining_actions,
            updated: record
                .updated_at
                .map(format_age)
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn state_label(state: PublishState) -> String {
    match state {
        PublishState::Idle => "idle".green().to_string(),
        PublishState::Publishing => "publishing".yellow().bold().to_string(),
    }
}

fn format_age(timestamp: DateTime<Utc>) -> String {
    let secs = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn age_uses_largest_whole_unit() {
        let now = Utc::now();
        assert_eq!(format_age(now - Duration::seconds(5)), "5s ago");
        assert_eq!(format_age(now - Duration::minutes(3)), "3m ago");
        assert_eq!(format_age(now - Duration::hours(2)), "2h ago");
        assert_eq!(format_age(now - Duration::days(4)), "4d ago");
    }

    #[test]
    fn future_timestamps_clamp_to_zero() {
        assert_eq!(format_age(Utc::now() + Duration::hours(1)), "0s ago");
    }
}
