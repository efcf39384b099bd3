//! Error types for cody-core.

use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by a collaborator (diff source, status store, queue,
/// notifier, blob store).
///
/// These are transient from the pipeline's point of view: they abort the
/// current ingest or drain step and are surfaced to the invoking platform.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error (queue payloads).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error (status documents).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A `git` invocation exited unsuccessfully.
    #[error("git command `{command}` failed: {stderr}")]
    Git { command: String, stderr: String },

    /// The requested commit, blob or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name that would escape its storage root (path separators, `..`, ...).
    #[error("invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    /// The collaborator is not reachable (closed channel, poisoned lock, ...).
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
}

/// A control file inside the repository could not be parsed.
#[derive(Debug, Error)]
pub enum ControlFileError {
    #[error("control file is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid ignore pattern on line {line} ({pattern:?}): {source}")]
    Pattern {
        line: usize,
        pattern: String,
        #[source]
        source: ignore::Error,
    },

    #[error("invalid ignore pattern set: {0}")]
    PatternSet(#[source] ignore::Error),

    #[error("malformed site config: {0}")]
    SiteConfig(#[from] serde_yaml::Error),

    #[error("site config must be a mapping of scalar values: {0}")]
    SiteConfigShape(String),
}

/// Publisher configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.cody/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Convenience constructor for [`BackendError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> BackendError {
    BackendError::Io {
        path: path.into(),
        source,
    }
}
