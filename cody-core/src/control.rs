//! Control files committed inside the published repository.
//!
//! - the ignore file: newline-separated gitignore-style glob patterns
//! - the site config: a flat YAML mapping of scalar values
//!
//! Both are parsed on every commit that touches them; a parse failure aborts
//! the ingest of that commit.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde_yaml::Value;

use crate::error::ControlFileError;
use crate::types::SiteConfig;

/// Site config key holding the publishable content root.
pub const CONTENT_ROOT_KEY: &str = "content_root";

/// Content root used when the site config does not name one.
pub const DEFAULT_CONTENT_ROOT: &str = "content/";

/// Parse an ignore file into its ordered list of patterns.
///
/// Blank lines and `#` comments are dropped; every remaining line must be a
/// valid glob.
pub fn parse_ignore_file(bytes: &[u8]) -> Result<Vec<String>, ControlFileError> {
    let text = std::str::from_utf8(bytes)?;
    let mut patterns = Vec::new();
    let mut builder = GitignoreBuilder::new("");
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        builder
            .add_line(None, line)
            .map_err(|source| ControlFileError::Pattern {
                line: index + 1,
                pattern: line.to_string(),
                source,
            })?;
        patterns.push(line.to_string());
    }
    Ok(patterns)
}

/// Parse the site config into a flat key-value map.
///
/// An empty document is an empty config. Nested mappings and sequences are
/// rejected.
pub fn parse_site_config(bytes: &[u8]) -> Result<SiteConfig, ControlFileError> {
    let text = std::str::from_utf8(bytes)?;
    let blank = text.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    });
    if blank {
        return Ok(SiteConfig::new());
    }
    let mapping = match serde_yaml::from_str::<Value>(text)? {
        Value::Null => return Ok(SiteConfig::new()),
        Value::Mapping(mapping) => mapping,
        other => {
            return Err(ControlFileError::SiteConfigShape(format!(
                "expected a mapping, found {}",
                value_kind(&other)
            )))
        }
    };

    let mut config = SiteConfig::new();
    for (key, value) in mapping {
        let key = scalar_to_string(&key).ok_or_else(|| {
            ControlFileError::SiteConfigShape(format!("non-scalar key ({})", value_kind(&key)))
        })?;
        let value = match &value {
            Value::Null => String::new(),
            other => scalar_to_string(other).ok_or_else(|| {
                ControlFileError::SiteConfigShape(format!(
                    "value of {key:?} is a {}",
                    value_kind(other)
                ))
            })?,
        };
        config.insert(key, value);
    }
    Ok(config)
}

/// The content root named by `config`, normalised to `dir/` form.
///
/// An empty root (`""` or `"/"`) publishes the whole tree.
pub fn content_root(config: &SiteConfig) -> String {
    let raw = config
        .get(CONTENT_ROOT_KEY)
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONTENT_ROOT);
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// Compiled ignore patterns.
///
/// Patterns use gitignore semantics relative to the repository root: a
/// pattern without a slash matches at any depth, a match on a directory
/// excludes everything below it, and `!pattern` re-includes.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    inner: Gitignore,
}

impl IgnoreMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ControlFileError> {
        let mut builder = GitignoreBuilder::new("");
        for (index, pattern) in patterns.iter().enumerate() {
            let pattern = pattern.as_ref();
            builder
                .add_line(None, pattern)
                .map_err(|source| ControlFileError::Pattern {
                    line: index + 1,
                    pattern: pattern.to_string(),
                    source,
                })?;
        }
        let inner = builder.build().map_err(ControlFileError::PatternSet)?;
        Ok(Self { inner })
    }

    /// An empty matcher that ignores nothing.
    pub fn empty() -> Self {
        Self {
            inner: Gitignore::empty(),
        }
    }

    /// Whether the repository path `path` (or one of its parent directories)
    /// is ignored.
    pub fn is_ignored(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return false;
        }
        self.inner
            .matched_path_or_any_parents(path, false)
            .is_ignore()
    }
}
