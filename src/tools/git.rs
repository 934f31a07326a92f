//! Git operations scoped to one workspace root.
//!
//! Every operation runs `git -C <root>` with a fixed agent identity. All git
//! processes spawned by one operation share a single deadline, so an
//! operation never outlives the adapter's timeout. The workspace root must be the repository top level; a parent
//! repository higher up the tree does not count as initialized.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::runtime::lock::LOCK_FILE_NAME;
use crate::tools::cmd::run_to_completion;
use crate::tools::patch::STAGING_PREFIX;

const AGENT_NAME: &str = "PDD Agent";
const AGENT_EMAIL: &str = "agent@pdd.local";
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum GitError {
    #[error("workspace is not a git repository; call git_init first")]
    NotInitialized,
    #[error("nothing to commit, working tree clean")]
    NothingToCommit,
    #[error("commit message must not be empty")]
    EmptyMessage,
    #[error("`git {command}` failed (exit {code:?}): {stderr}")]
    Failed {
        command: String,
        stderr: String,
        code: Option<i32>,
    },
    #[error("`git {command}` timed out")]
    Timeout { command: String },
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to update git excludes: {0}")]
    Excludes(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInit {
    /// False when the root already was a repository.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Two-letter porcelain code, e.g. `??` or ` M`.
    pub code: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub repository: bool,
    pub clean: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub porcelain: String,
    pub entries: Vec<StatusEntry>,
}

impl GitStatus {
    fn not_a_repository() -> Self {
        Self {
            repository: false,
            clean: true,
            branch: None,
            porcelain: String::new(),
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitDiff {
    pub staged: bool,
    pub diff: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub hash: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct GitAdapter {
    timeout: Duration,
    max_output_bytes: usize,
}

impl Default for GitAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_TIMEOUT, 200_000)
    }
}

impl GitAdapter {
    pub fn new(timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            timeout,
            max_output_bytes,
        }
    }

    pub fn is_repository(root: &Path) -> bool {
        root.join(".git").exists()
    }

    pub async fn init(&self, root: &Path) -> Result<GitInit, GitError> {
        let deadline = self.deadline();
        let created = !Self::is_repository(root);
        if created {
            self.git(root, &["init", "-q"], deadline).await?;
            tracing::info!(root = %root.display(), "initialized git repository");
        }
        ensure_excludes(root)?;
        Ok(GitInit { created })
    }

    /// Never fails on a plain directory; reports `repository: false`.
    pub async fn status(&self, root: &Path) -> Result<GitStatus, GitError> {
        if !Self::is_repository(root) {
            return Ok(GitStatus::not_a_repository());
        }
        ensure_excludes(root)?;

        let deadline = self.deadline();
        let porcelain = self
            .git(root, &["status", "--porcelain", "--untracked-files=all"], deadline)
            .await?;
        let entries: Vec<StatusEntry> = porcelain.lines().filter_map(parse_status_line).collect();
        let branch = self
            .git(root, &["symbolic-ref", "--short", "-q", "HEAD"], deadline)
            .await
            .ok()
            .map(|out| out.trim().to_string())
            .filter(|name| !name.is_empty());

        Ok(GitStatus {
            repository: true,
            clean: entries.is_empty(),
            branch,
            porcelain,
            entries,
        })
    }

    pub async fn diff(&self, root: &Path, staged: bool) -> Result<GitDiff, GitError> {
        self.require_repository(root)?;
        let mut args = vec!["diff", "--no-color", "--no-ext-diff"];
        if staged {
            args.push("--cached");
        }
        let outcome = self.run(root, &args, self.deadline()).await?;
        Ok(GitDiff {
            staged,
            diff: outcome.stdout,
            truncated: outcome.truncated,
        })
    }

    /// Stage everything and commit it. Fails with
    /// [`GitError::NothingToCommit`] when the tree has no changes.
    pub async fn commit(&self, root: &Path, message: &str) -> Result<GitCommit, GitError> {
        self.require_repository(root)?;
        let message = message.trim();
        if message.is_empty() {
            return Err(GitError::EmptyMessage);
        }
        ensure_excludes(root)?;

        let deadline = self.deadline();
        self.git(root, &["add", "-A"], deadline).await?;
        let staged = self.git(root, &["status", "--porcelain"], deadline).await?;
        if staged.trim().is_empty() {
            return Err(GitError::NothingToCommit);
        }

        self.git(root, &["commit", "-q", "-m", message], deadline).await?;
        let hash = self
            .git(root, &["rev-parse", "HEAD"], deadline)
            .await?
            .trim()
            .to_string();
        tracing::info!(root = %root.display(), %hash, "committed workspace changes");

        Ok(GitCommit {
            hash,
            message: message.to_string(),
        })
    }

    fn require_repository(&self, root: &Path) -> Result<(), GitError> {
        if Self::is_repository(root) {
            Ok(())
        } else {
            Err(GitError::NotInitialized)
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Run git and return stdout, failing on a non-zero exit.
    async fn git(&self, root: &Path, args: &[&str], deadline: Instant) -> Result<String, GitError> {
        Ok(self.run(root, args, deadline).await?.stdout)
    }

    async fn run(
        &self,
        root: &Path,
        args: &[&str],
        deadline: Instant,
    ) -> Result<crate::tools::cmd::ProcessOutcome, GitError> {
        let name = args.first().copied().unwrap_or_default().to_string();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GitError::Timeout { command: name });
        }

        let mut command = Command::new("git");
        command
            .arg("-C")
            .arg(root)
            .args(args)
            .env("GIT_AUTHOR_NAME", AGENT_NAME)
            .env("GIT_AUTHOR_EMAIL", AGENT_EMAIL)
            .env("GIT_COMMITTER_NAME", AGENT_NAME)
            .env("GIT_COMMITTER_EMAIL", AGENT_EMAIL)
            .env("GIT_TERMINAL_PROMPT", "0");

        let outcome = run_to_completion(command, remaining, self.max_output_bytes)
            .await
            .map_err(GitError::Spawn)?;

        if outcome.timed_out {
            return Err(GitError::Timeout { command: name });
        }
        if outcome.exit_code != Some(0) {
            return Err(GitError::Failed {
                command: args.join(" "),
                stderr: outcome.stderr.trim().to_string(),
                code: outcome.exit_code,
            });
        }
        Ok(outcome)
    }
}

/// Keep runtime bookkeeping files out of status and commits.
fn ensure_excludes(root: &Path) -> Result<(), GitError> {
    let info_dir = root.join(".git").join("info");
    let exclude = info_dir.join("exclude");
    let patterns = [LOCK_FILE_NAME.to_string(), format!("{STAGING_PREFIX}*")];

    let current = std::fs::read_to_string(&exclude).unwrap_or_default();
    let missing: Vec<&String> = patterns
        .iter()
        .filter(|p| !current.lines().any(|line| line.trim() == p.as_str()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(&info_dir).map_err(GitError::Excludes)?;
    let mut updated = current;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    for pattern in missing {
        updated.push_str(pattern);
        updated.push('\n');
    }
    std::fs::write(&exclude, updated).map_err(GitError::Excludes)
}

fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if line.len() < 4 {
        return None;
    }
    let (code, rest) = line.split_at(2);
    let path = rest.trim_start();
    let path = path.trim_matches('"');
    Some(StatusEntry {
        code: code.to_string(),
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn parses_porcelain_lines() {
        assert_eq!(
            parse_status_line("?? src/new file.rs"),
            Some(StatusEntry {
                code: "??".into(),
                path: "src/new file.rs".into()
            })
        );
        assert_eq!(parse_status_line(" M a.txt").unwrap().code, " M");
        assert_eq!(parse_status_line(""), None);
    }

    #[tokio::test]
    async fn status_outside_repository_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let status = GitAdapter::default().status(dir.path()).await.unwrap();
        assert!(!status.repository);
        assert!(status.entries.is_empty());
    }

    #[tokio::test]
    async fn diff_and_commit_require_init() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitAdapter::default();
        assert!(matches!(
            git.diff(dir.path(), false).await,
            Err(GitError::NotInitialized)
        ));
        assert!(matches!(
            git.commit(dir.path(), "msg").await,
            Err(GitError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn init_status_commit_cycle() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let git = GitAdapter::default();

        assert!(git.init(root).await.unwrap().created);
        assert!(!git.init(root).await.unwrap().created);

        std::fs::write(root.join("main.py"), "print('hi')\n").unwrap();
        std::fs::write(root.join(LOCK_FILE_NAME), "{}").unwrap();

        let status = git.status(root).await.unwrap();
        assert!(status.repository);
        assert!(!status.clean);
        let paths: Vec<&str> = status.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["main.py"]);

        let commit = git.commit(root, "initial").await.unwrap();
        assert_eq!(commit.hash.len(), 40);
        assert!(git.status(root).await.unwrap().clean);

        assert!(matches!(
            git.commit(root, "again").await,
            Err(GitError::NothingToCommit)
        ));

        std::fs::write(root.join("main.py"), "print('bye')\n").unwrap();
        let diff = git.diff(root, false).await.unwrap();
        assert!(diff.diff.contains("+print('bye')"));
        assert!(git.diff(root, true).await.unwrap().diff.is_empty());
    }

    #[tokio::test]
    async fn spent_budget_stops_before_spawning_git() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();

        let git = GitAdapter::new(Duration::ZERO, 1024);
        match git.commit(dir.path(), "msg").await {
            Err(GitError::Timeout { command }) => assert_eq!(command, "add"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            git.diff(dir.path(), false).await,
            Err(GitError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let git = GitAdapter::default();
        git.init(dir.path()).await.unwrap();
        assert!(matches!(
            git.commit(dir.path(), "  ").await,
            Err(GitError::EmptyMessage)
        ));
    }
}
