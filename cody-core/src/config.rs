//! Publisher configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.cody/
//!   config.yaml            (optional; every key has a default)
//!   repositories/<repo>/   (default git repositories root)
//!   target/<bucket>/<key>  (default filesystem target store)
//!   state/status/          (publish target records)
//!   state/queue/           (action spool)
//! ```
//!
//! Like the status store, every loader has two forms: `fn_at(home: &Path, …)`
//! for tests and `fn(…)` deriving home from `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ObjectLocation;
use crate::error::ConfigError;
use crate::types::{BranchName, RepositoryName};

pub const CONFIG_FILE: &str = "config.yaml";

/// Default path of the ignore-patterns control file.
pub const DEFAULT_IGNORE_FILE: &str = ".codyignore";

/// Default path of the site-config control file.
pub const DEFAULT_SITE_CONFIG_FILE: &str = "cody.yaml";

/// `<home>/.cody`
pub fn cody_root(home: &Path) -> PathBuf {
    home.join(".cody")
}

/// `<home>/.cody/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    cody_root(home).join(CONFIG_FILE)
}

/// `<home>/.cody/state/status`
pub fn status_dir_at(home: &Path) -> PathBuf {
    cody_root(home).join("state").join("status")
}

/// `<home>/.cody/state/queue`
pub fn queue_dir_at(home: &Path) -> PathBuf {
    cody_root(home).join("state").join("queue")
}

/// Root of `~/.cody/config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Directory holding one git repository per repository name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repositories_root: Option<PathBuf>,
    /// Root directory of the filesystem target store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_root: Option<PathBuf>,
    pub destination: DestinationTemplate,
    pub control_files: ControlFiles,
    pub queue: QueueSettings,
    pub stale_actions: StalePolicy,
}

impl PublisherConfig {
    pub fn repositories_root_at(&self, home: &Path) -> PathBuf {
        self.repositories_root
            .clone()
            .unwrap_or_else(|| cody_root(home).join("repositories"))
    }

    pub fn target_root_at(&self, home: &Path) -> PathBuf {
        self.target_root
            .clone()
            .unwrap_or_else(|| cody_root(home).join("target"))
    }
}

/// Destination bucket and key prefix templates; `{repository}` and
/// `{branch}` are substituted per action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationTemplate {
    pub bucket: String,
    pub prefix: String,
}

impl Default for DestinationTemplate {
    fn default() -> Self {
        Self {
            bucket: "{repository}".to_string(),
            prefix: "{branch}".to_string(),
        }
    }
}

impl DestinationTemplate {
    pub fn resolve(&self, repository: &RepositoryName, branch: &BranchName) -> Destination {
        let bucket = substitute(&self.bucket, repository, branch);
        let prefix = substitute(&self.prefix, repository, branch);
        let prefix = prefix.trim_matches('/');
        Destination {
            bucket,
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{prefix}/")
            },
        }
    }
}

fn substitute(template: &str, repository: &RepositoryName, branch: &BranchName) -> String {
    template
        .replace("{repository}", repository.as_str())
        .replace("{branch}", branch.as_str())
}

/// A resolved destination: bucket plus a key prefix ending in `/` (or empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub bucket: String,
    pub prefix: String,
}

impl Destination {
    pub fn location(&self, relative_path: &str) -> ObjectLocation {
        ObjectLocation {
            bucket: self.bucket.clone(),
            key: format!("{}{}", self.prefix, relative_path),
        }
    }
}

/// Well-known control file paths inside the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlFiles {
    pub ignore_file: String,
    pub site_config_file: String,
}

impl Default for ControlFiles {
    fn default() -> Self {
        Self {
            ignore_file: DEFAULT_IGNORE_FILE.to_string(),
            site_config_file: DEFAULT_SITE_CONFIG_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// How long a dequeued, unacknowledged message stays invisible.
    pub visibility_timeout_secs: u64,
    /// Interval of the daemon's redelivery drain trigger.
    pub redelivery_poll_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            redelivery_poll_secs: 30,
        }
    }
}

impl QueueSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn redelivery_poll(&self) -> Duration {
        Duration::from_secs(self.redelivery_poll_secs.max(1))
    }
}

/// What the drain worker does with an action superseded by a newer target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Delete the message and trigger the next drain step immediately.
    #[default]
    AckAndRetrigger,
    /// Leave the message unacknowledged and stop; the queue redelivers it
    /// after the visibility timeout.
    LeaveForRedelivery,
}

/// Load `<home>/.cody/config.yaml`, falling back to defaults when absent.
pub fn load_at(home: &Path) -> Result<PublisherConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(PublisherConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    if contents.trim().is_empty() {
        return Ok(PublisherConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<PublisherConfig, ConfigError> {
    load_at(&home()?)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
