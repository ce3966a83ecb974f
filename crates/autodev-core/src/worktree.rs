//! # Worktree Manager
//!
//! Creates and cleans isolated working copies of a repository, one per
//! issue. Copies are materialized with `git worktree add` out of the
//! configured clone; the subprocess is invoked through the [`GitRunner`]
//! seam so tests run without a real repository.
//!
//! Operations for one issue id are serialized through a keyed lock;
//! distinct issues proceed in parallel. Creation for an issue that already
//! has a live worktree is rejected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::routing::WorktreeMode;
use crate::{IssueId, Timestamp};

// ============================================================================
// Errors
// ============================================================================

/// Worktree lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Worktree for {issue} already exists")]
    Exists { issue: IssueId },

    #[error("Worktree for {issue} at {path} has uncommitted changes")]
    Busy { issue: IssueId, path: PathBuf },

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("I/O failure at {path}: {message}")]
    Io { path: String, message: String },
}

impl WorktreeError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Git subprocess seam
// ============================================================================

/// Captured output of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Surface the subprocess stderr verbatim when the command failed.
    pub fn ok(self, args: &[&str]) -> Result<Self, WorktreeError> {
        if self.success {
            Ok(self)
        } else {
            Err(WorktreeError::Git {
                command: args.join(" "),
                message: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs git subcommands; injected so tests substitute a script.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, WorktreeError>;
}

/// Deadline for one git invocation; a hung subprocess is killed when the
/// waiting future is dropped.
const GIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Real git via `tokio::process`.
pub struct SystemGitRunner;

#[async_trait]
impl GitRunner for SystemGitRunner {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, WorktreeError> {
        let child = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorktreeError::Io {
                path: dir.display().to_string(),
                message: format!("failed to spawn git: {e}"),
            })?;

        let output = tokio::time::timeout(GIT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| WorktreeError::Git {
                command: args.join(" "),
                message: format!("timed out after {}s", GIT_TIMEOUT.as_secs()),
            })?
            .map_err(|e| WorktreeError::Io {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(GitOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ============================================================================
// Worktree info
// ============================================================================

/// A live working copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub issue_id: IssueId,

    /// The clone this worktree was created from
    pub repo_path: PathBuf,

    /// The working copy itself
    pub path: PathBuf,

    pub branch: String,
    pub base_commit: String,
    pub created_at: Timestamp,
}

// ============================================================================
// Manager
// ============================================================================

/// Worktree lifecycle manager.
pub struct WorktreeManager {
    base_dir: PathBuf,
    clock: Arc<dyn Clock>,
    git: Arc<dyn GitRunner>,
    active: Mutex<HashMap<IssueId, WorktreeInfo>>,
    locks: Mutex<HashMap<IssueId, Arc<Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new(base_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>, git: Arc<dyn GitRunner>) -> Self {
        Self {
            base_dir: base_dir.into(),
            clock,
            git,
            active: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Directory a worktree for `issue` lives at.
    pub fn path_for(&self, issue: &IssueId) -> PathBuf {
        self.base_dir.join(issue.as_path_component())
    }

    /// Create a working copy for `issue` under the given mode.
    ///
    /// Fails with [`WorktreeError::Exists`] when a live worktree is already
    /// registered for the issue.
    pub async fn create(
        &self,
        issue: &IssueId,
        repo_path: &Path,
        base_branch: &str,
        mode: WorktreeMode,
        slug: Option<&str>,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let lock = self.lock_for(issue).await;
        let _guard = lock.lock().await;

        if self.active.lock().await.contains_key(issue) {
            return Err(WorktreeError::Exists {
                issue: issue.clone(),
            });
        }

        let path = self.path_for(issue);
        let branch = match slug {
            Some(slug) => format!("{}-{}", issue.branch_name(), slug),
            None => issue.branch_name(),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::io(parent, e))?;
        }

        let info = match mode {
            WorktreeMode::Fresh => {
                self.remove_copy(repo_path, &path).await?;
                self.materialize(issue, repo_path, &path, &branch, base_branch)
                    .await?
            }
            WorktreeMode::Reuse => {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    self.reuse_existing(issue, repo_path, &path).await?
                } else {
                    self.materialize(issue, repo_path, &path, &branch, base_branch)
                        .await?
                }
            }
            WorktreeMode::BranchPerIssue => {
                // Branch creation is allowed to fail when the branch already
                // exists from a previous attempt.
                let _ = self
                    .git
                    .run(repo_path, &["branch", &branch, base_branch])
                    .await;
                self.remove_copy(repo_path, &path).await?;

                let args = ["worktree", "add", path_str(&path), branch.as_str()];
                self.git.run(repo_path, &args).await?.ok(&args)?;
                match self.describe(issue, repo_path, &path).await {
                    Ok(info) => info,
                    Err(e) => {
                        let _ = self.remove_copy(repo_path, &path).await;
                        return Err(e);
                    }
                }
            }
        };

        info!(
            issue = %issue,
            path = %info.path.display(),
            branch = %info.branch,
            "worktree created"
        );

        self.active.lock().await.insert(issue.clone(), info.clone());
        Ok(info)
    }

    /// Remove the working copy after a successful session; retain it for
    /// operator inspection after a failed one. Idempotent.
    pub async fn cleanup(&self, issue: &IssueId, session_succeeded: bool) -> Result<(), WorktreeError> {
        let lock = self.lock_for(issue).await;
        let _guard = lock.lock().await;

        let info = self.active.lock().await.remove(issue);
        let path = self.path_for(issue);

        if !session_succeeded {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                warn!(issue = %issue, path = %path.display(), "retaining worktree for inspection");
            }
            return Ok(());
        }

        let repo_path = info.map(|i| i.repo_path);
        if let Some(repo_path) = repo_path {
            self.remove_copy(&repo_path, &path).await?;
        } else if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| WorktreeError::io(&path, e))?;
        }

        debug!(issue = %issue, "worktree cleaned up");
        Ok(())
    }

    /// Issues with a working copy: live registrations plus whatever is on
    /// disk from earlier runs.
    pub async fn list_active(&self) -> BTreeSet<IssueId> {
        let mut issues: BTreeSet<IssueId> = self.active.lock().await.keys().cloned().collect();

        if let Ok(mut entries) = tokio::fs::read_dir(&self.base_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    if let Some(name) = entry.file_name().to_str() {
                        if let Ok(issue) = IssueId::new(name) {
                            issues.insert(issue);
                        }
                    }
                }
            }
        }

        issues
    }

    /// Number of live (in-process) worktrees.
    pub async fn live_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Whether the working copy at `path` has no uncommitted changes.
    pub async fn is_clean(&self, path: &Path) -> Result<bool, WorktreeError> {
        let args = ["status", "--porcelain"];
        let status = self.git.run(path, &args).await?.ok(&args)?;
        Ok(status.stdout.trim().is_empty())
    }

    async fn lock_for(&self, issue: &IssueId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(issue.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// `git worktree add` a new copy, cleaning the partial directory when a
    /// later step fails.
    async fn materialize(
        &self,
        issue: &IssueId,
        repo_path: &Path,
        path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let args = ["worktree", "add", "-B", branch, path_str(path), base_branch];
        self.git.run(repo_path, &args).await?.ok(&args)?;

        match self.describe(issue, repo_path, path).await {
            Ok(info) => Ok(info),
            Err(e) => {
                // The checkout happened but the copy is unusable; do not
                // leave the partial directory behind.
                let _ = self.remove_copy(repo_path, path).await;
                Err(e)
            }
        }
    }

    /// Return an existing clean copy, or fail busy.
    async fn reuse_existing(
        &self,
        issue: &IssueId,
        repo_path: &Path,
        path: &Path,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let args = ["status", "--porcelain"];
        let status = self.git.run(path, &args).await?.ok(&args)?;
        if !status.stdout.trim().is_empty() {
            return Err(WorktreeError::Busy {
                issue: issue.clone(),
                path: path.to_path_buf(),
            });
        }

        self.describe(issue, repo_path, path).await
    }

    /// Read branch and head commit out of a working copy.
    async fn describe(
        &self,
        issue: &IssueId,
        repo_path: &Path,
        path: &Path,
    ) -> Result<WorktreeInfo, WorktreeError> {
        let head_args = ["rev-parse", "HEAD"];
        let head = self.git.run(path, &head_args).await?.ok(&head_args)?;

        let branch_args = ["rev-parse", "--abbrev-ref", "HEAD"];
        let branch = self.git.run(path, &branch_args).await?.ok(&branch_args)?;

        Ok(WorktreeInfo {
            issue_id: issue.clone(),
            repo_path: repo_path.to_path_buf(),
            path: path.to_path_buf(),
            branch: branch.stdout.trim().to_string(),
            base_commit: head.stdout.trim().to_string(),
            created_at: self.clock.now(),
        })
    }

    /// Detach and delete a working copy if present. Git failures here are
    /// tolerated; the directory removal is what matters.
    async fn remove_copy(&self, repo_path: &Path, path: &Path) -> Result<(), WorktreeError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }

        let _ = self
            .git
            .run(repo_path, &["worktree", "remove", "--force", path_str(path)])
            .await;

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| WorktreeError::io(path, e))?;
        }

        Ok(())
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}

#[cfg(test)]
#[path = "worktree_tests.rs"]
mod tests;
