//! Worktree and merge plumbing for the pipeline core.
//!
//! [`GitService`] wraps the `git` CLI (see [`cli`]) with the small set of
//! operations the pipeline needs: creating/removing per-task worktrees and
//! feature branches, bringing the base branch into a feature branch,
//! detecting unresolved-merge conflict markers, and performing the final
//! no-fast-forward merge into the base branch.

pub mod cli;
pub mod worktree;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use cli::{GitCli, GitCliError, StatusEntry};
pub use worktree::WorktreeManager;

#[derive(Debug, Error)]
pub enum GitServiceError {
    #[error(transparent)]
    Cli(#[from] GitCliError),
    #[error("worktree path already exists: {0}")]
    WorktreePathExists(PathBuf),
    #[error("merge conflicts in {worktree}: {files:?}")]
    MergeConflicts {
        worktree: PathBuf,
        files: Vec<String>,
    },
}

/// Outcome of bringing the base branch into a feature branch (step 1 of the
/// merge coordinator's five-step protocol).
pub enum BaseIntoFeatureOutcome {
    Clean,
    Conflicted { files: Vec<String> },
}

#[derive(Clone, Default)]
pub struct GitService {
    cli: GitCli,
}

impl GitService {
    pub fn new() -> Self {
        Self { cli: GitCli::new() }
    }

    /// Deterministic feature-branch name for a task, unique within a run.
    pub fn feature_branch_name(task_id: uuid::Uuid) -> String {
        format!("kugutsu/task-{task_id}")
    }

    /// Create the feature branch off `base_branch`'s current tip and bind a
    /// fresh worktree at `worktree_path`. Fails loudly if the path already
    /// exists, per the worktree manager's invariant of at most one active
    /// worktree per task.
    pub fn create_worktree(
        &self,
        base_repo: &Path,
        worktree_path: &Path,
        branch_name: &str,
        base_branch: &str,
    ) -> Result<(), GitServiceError> {
        if worktree_path.exists() {
            return Err(GitServiceError::WorktreePathExists(worktree_path.to_path_buf()));
        }
        self.cli
            .worktree_add(base_repo, worktree_path, branch_name, base_branch)?;
        Ok(())
    }

    /// Remove a worktree. Safe to call repeatedly: a missing worktree is not
    /// an error.
    pub fn remove_worktree(&self, base_repo: &Path, worktree_path: &Path) -> Result<(), GitServiceError> {
        if !worktree_path.exists() {
            return Ok(());
        }
        match self.cli.worktree_remove(base_repo, worktree_path, true) {
            Ok(()) => Ok(()),
            Err(GitCliError::CommandFailed(msg)) if msg.contains("is not a working tree") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_branch(&self, base_repo: &Path, branch: &str) -> Result<(), GitServiceError> {
        match self.cli.branch_delete(base_repo, branch, true) {
            Ok(()) => Ok(()),
            Err(GitCliError::InvalidReference(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Step 1 of the merge coordinator: bring the current base branch tip
    /// into the feature branch, inside the task's worktree.
    pub fn bring_base_into_feature(
        &self,
        worktree_path: &Path,
        base_branch: &str,
    ) -> Result<BaseIntoFeatureOutcome, GitServiceError> {
        match self.cli.merge(worktree_path, base_branch) {
            Ok(()) => Ok(BaseIntoFeatureOutcome::Clean),
            Err(GitCliError::CommandFailed(_)) => {
                let files = self.conflicted_files(worktree_path)?;
                if files.is_empty() {
                    // merge failed for a reason other than conflicts (e.g. dirty
                    // worktree); surface it as a retryable command failure.
                    return Err(GitServiceError::Cli(GitCliError::CommandFailed(
                        "merge failed with no conflict markers".to_string(),
                    )));
                }
                Ok(BaseIntoFeatureOutcome::Conflicted { files })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Step 2: inspect `git status --porcelain` for the `UU `/`AA `/`DD `
    /// unresolved-merge prefixes.
    pub fn conflicted_files(&self, worktree_path: &Path) -> Result<Vec<String>, GitServiceError> {
        let entries = self.cli.status_porcelain(worktree_path)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.is_conflict_marker())
            .map(|e| e.path)
            .collect())
    }

    /// Abort an in-flight merge in `worktree_path` (used both for the
    /// bring-base-into-feature step on a dropped conflict, and for a failed
    /// final merge before a retry).
    pub fn abort_merge(&self, worktree_path: &Path) -> Result<(), GitServiceError> {
        if self.cli.is_merge_in_progress(worktree_path) {
            self.cli.merge_abort(worktree_path)?;
        }
        Ok(())
    }

    /// Step 3: check out the base branch in the main repository working
    /// directory and merge the feature branch with a merge commit.
    pub fn final_merge(
        &self,
        base_repo: &Path,
        feature_branch: &str,
        base_branch: &str,
        message: &str,
    ) -> Result<String, GitServiceError> {
        self.cli.checkout(base_repo, base_branch)?;
        let commit = self.cli.merge_no_ff(base_repo, feature_branch, message)?;
        Ok(commit)
    }

    pub fn validate_repo(&self, base_repo: &Path) -> Result<(), GitServiceError> {
        self.cli.rev_parse(base_repo, "HEAD")?;
        Ok(())
    }

    /// Discards git's own bookkeeping for worktrees whose directories are
    /// already gone from disk.
    pub fn prune_worktrees(&self, base_repo: &Path) -> Result<(), GitServiceError> {
        self.cli.worktree_prune(base_repo)?;
        Ok(())
    }
}
