//! `git` CLI backed diff source.
//!
//! Repositories live at `<repositories_root>/<repository>` (bare or not).
//! Every invocation runs with system and global config disabled and terminal
//! prompts off.

use std::path::{Path, PathBuf};
use std::process::Command;

use cody_core::{
    BackendError, BlobId, BlobRef, BranchName, ChangeKind, CommitId, DiffEntry, DiffSource,
    RepositoryName,
};

/// Hash of the empty tree object (SHA-1 repositories).
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbe4904b";

/// Mode of a submodule entry; these have no blob to publish.
const GITLINK_MODE: &str = "160000";

const ZERO_MODE: &str = "000000";

#[derive(Debug, Clone)]
pub struct GitCliSource {
    repositories_root: PathBuf,
}

impl GitCliSource {
    pub fn new(repositories_root: impl Into<PathBuf>) -> Self {
        Self {
            repositories_root: repositories_root.into(),
        }
    }

    pub fn repository_dir(&self, repository: &RepositoryName) -> Result<PathBuf, BackendError> {
        let name = repository.as_str();
        if name.is_empty() || name.starts_with('.') || name.contains(&['/', '\\', '\0'][..]) {
            return Err(BackendError::InvalidName {
                kind: "repository",
                name: name.to_string(),
            });
        }
        let dir = self.repositories_root.join(name);
        if !dir.is_dir() {
            return Err(BackendError::NotFound(format!(
                "repository {name} at {}",
                dir.display()
            )));
        }
        Ok(dir)
    }

    /// Resolve the head commit of `branch`.
    pub fn resolve_branch(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
    ) -> Result<CommitId, BackendError> {
        let dir = self.repository_dir(repository)?;
        let spec = format!("refs/heads/{branch}^{{commit}}");
        let out = run(&dir, &["rev-parse", "--verify", "--quiet", &spec])?;
        let id = String::from_utf8_lossy(&out).trim().to_string();
        if id.is_empty() {
            return Err(BackendError::NotFound(format!("branch {branch} in {repository}")));
        }
        Ok(CommitId(id))
    }
}

/// A `git` command with a clean, non-interactive environment.
fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd
}

fn run(workdir: &Path, args: &[&str]) -> Result<Vec<u8>, BackendError> {
    let command = format!("git {}", args.join(" "));
    let output = git_command(workdir).args(args).output().map_err(|e| BackendError::Git {
        command: command.clone(),
        stderr: e.to_string(),
    })?;
    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let missing = stderr.contains("bad object")
        || stderr.contains("not a valid object")
        || stderr.contains("unknown revision")
        || stderr.contains("Not a valid object name")
        || (stderr.is_empty() && args.contains(&"--verify"));
    if missing {
        return Err(BackendError::NotFound(format!("{command}: {stderr}")));
    }
    Err(BackendError::Git { command, stderr })
}

/// Object ids come from commit events and queue messages; keep them from
/// being read as options.
fn check_object_id(kind: &'static str, id: &str) -> Result<(), BackendError> {
    if id.is_empty() || id.starts_with('-') || id.contains(char::is_whitespace) {
        return Err(BackendError::InvalidName {
            kind,
            name: id.to_string(),
        });
    }
    Ok(())
}

/// Parse `git diff-tree -r -z --no-renames` output.
///
/// Records are `:<src mode> <dst mode> <src id> <dst id> <status>\0<path>\0`.
pub fn parse_diff_tree(output: &[u8]) -> Result<Vec<DiffEntry>, BackendError> {
    let malformed = |detail: &str| BackendError::Git {
        command: "git diff-tree".to_string(),
        stderr: format!("unexpected output: {detail}"),
    };

    let mut entries = Vec::new();
    let mut fields = output.split(|b| *b == 0).filter(|f| !f.is_empty());
    while let Some(header) = fields.next() {
        let header = std::str::from_utf8(header).map_err(|_| malformed("non-UTF-8 header"))?;
        let header = header.trim_start_matches('\n');
        let Some(header) = header.strip_prefix(':') else {
            return Err(malformed(header));
        };
        let parts: Vec<&str> = header.split(' ').collect();
        let &[src_mode, dst_mode, src_id, dst_id, _status] = parts.as_slice() else {
            return Err(malformed(header));
        };
        let path = fields.next().ok_or_else(|| malformed("missing path"))?;
        let path = String::from_utf8_lossy(path).into_owned();

        let side = |mode: &str, id: &str| {
            (mode != ZERO_MODE && mode != GITLINK_MODE).then(|| BlobRef {
                path: path.clone(),
                blob_id: BlobId::from(id),
            })
        };
        let before = side(src_mode, src_id);
        let after = side(dst_mode, dst_id);
        let kind = match (&before, &after) {
            (_, Some(_)) => ChangeKind::AddedOrModified,
            (Some(_), None) => ChangeKind::Deleted,
            (None, None) => continue,
        };
        entries.push(DiffEntry {
            kind,
            before,
            after,
        });
    }
    Ok(entries)
}

impl DiffSource for GitCliSource {
    fn diff(
        &self,
        repository: &RepositoryName,
        from: Option<&CommitId>,
        to: &CommitId,
    ) -> Result<Vec<DiffEntry>, BackendError> {
        let dir = self.repository_dir(repository)?;
        let from = from.map(CommitId::as_str).unwrap_or(EMPTY_TREE);
        check_object_id("commit", from)?;
        check_object_id("commit", to.as_str())?;
        let out = run(
            &dir,
            &["diff-tree", "-r", "-z", "--no-renames", from, to.as_str()],
        )?;
        parse_diff_tree(&out)
    }

    fn get_blob(&self, repository: &RepositoryName, blob_id: &BlobId) -> Result<Vec<u8>, BackendError> {
        let dir = self.repository_dir(repository)?;
        check_object_id("blob", blob_id.as_str())?;
        run(&dir, &["cat-file", "blob", blob_id.as_str()])
    }
}
