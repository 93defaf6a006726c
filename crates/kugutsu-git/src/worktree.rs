//! Per-task worktree bookkeeping on top of [`GitService`].

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use kugutsu_types::{TaskId, WorkspaceBinding};
use tracing::{debug, info};

use crate::{GitService, GitServiceError};

/// Creates/removes per-task isolated worktrees and feature branches off the
/// base branch, tracking at most one active worktree per task id.
pub struct WorktreeManager {
    git: GitService,
    base_repo: PathBuf,
    worktree_base: PathBuf,
    base_branch: String,
    active: DashMap<TaskId, WorkspaceBinding>,
}

impl WorktreeManager {
    pub fn new(base_repo: PathBuf, worktree_base: PathBuf, base_branch: String) -> Self {
        Self {
            git: GitService::new(),
            base_repo,
            worktree_base,
            base_branch,
            active: DashMap::new(),
        }
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn base_repo(&self) -> &Path {
        &self.base_repo
    }

    pub fn binding_for(&self, task_id: TaskId) -> Option<WorkspaceBinding> {
        self.active.get(&task_id).map(|b| b.clone())
    }

    /// Creates a fresh worktree for `task_id`, rooted at the base branch's
    /// current tip, unconditionally replacing any prior binding. Used both
    /// for a task's very first dispatch and whenever `forceNewWorktree` is
    /// set because a dependency just merged.
    pub fn create_worktree_forced(&self, task_id: TaskId) -> Result<WorkspaceBinding, GitServiceError> {
        if let Some((_, prev)) = self.active.remove(&task_id) {
            debug!(%task_id, path = %prev.worktree_path.display(), "replacing existing worktree");
            let _ = self.git.remove_worktree(&self.base_repo, &prev.worktree_path);
        }

        let branch_name = GitService::feature_branch_name(task_id);
        let worktree_path = self.worktree_base.join(task_id.to_string());

        self.git
            .create_worktree(&self.base_repo, &worktree_path, &branch_name, &self.base_branch)?;

        let binding = WorkspaceBinding {
            branch_name,
            worktree_path,
        };
        info!(%task_id, branch = %binding.branch_name, path = %binding.worktree_path.display(), "created worktree");
        self.active.insert(task_id, binding.clone());
        Ok(binding)
    }

    /// Creates a worktree only if the task has none bound yet; otherwise
    /// returns the existing binding.
    pub fn ensure_worktree(&self, task_id: TaskId) -> Result<WorkspaceBinding, GitServiceError> {
        if let Some(existing) = self.binding_for(task_id) {
            return Ok(existing);
        }
        self.create_worktree_forced(task_id)
    }

    pub fn remove_worktree(&self, task_id: TaskId) -> Result<(), GitServiceError> {
        if let Some((_, binding)) = self.active.remove(&task_id) {
            self.git.remove_worktree(&self.base_repo, &binding.worktree_path)?;
        }
        Ok(())
    }

    /// Removes the worktree and, unless `delete_branch` is false (set by the
    /// coordinator for conflict-resolution tasks so the branch under repair
    /// survives), deletes the feature branch too.
    pub fn cleanup_completed_task(&self, task_id: TaskId, delete_branch: bool) -> Result<(), GitServiceError> {
        if let Some((_, binding)) = self.active.remove(&task_id) {
            self.git.remove_worktree(&self.base_repo, &binding.worktree_path)?;
            if delete_branch {
                self.git.delete_branch(&self.base_repo, &binding.branch_name)?;
            }
        }
        Ok(())
    }

    /// Full sweep at shutdown.
    pub fn cleanup_all(&self, delete_branches: bool) -> Result<(), GitServiceError> {
        let task_ids: Vec<TaskId> = self.active.iter().map(|e| *e.key()).collect();
        for task_id in task_ids {
            self.cleanup_completed_task(task_id, delete_branches)?;
        }
        Ok(())
    }

    pub fn git(&self) -> &GitService {
        &self.git
    }

    /// Removes every directory directly under `worktree_base`, regardless of
    /// whether this process instance has it tracked in `active`. Used by the
    /// CLI's standalone `--cleanup` mode, which runs without ever having
    /// built up in-memory bindings for worktrees a prior, killed run left
    /// behind.
    pub fn cleanup_all_task_worktrees(&self) -> Result<(), GitServiceError> {
        if self.worktree_base.is_dir() {
            for entry in std::fs::read_dir(&self.worktree_base).map_err(|e| {
                GitServiceError::Cli(crate::GitCliError::CommandFailed(e.to_string()))
            })? {
                let entry = entry.map_err(|e| {
                    GitServiceError::Cli(crate::GitCliError::CommandFailed(e.to_string()))
                })?;
                if entry.path().is_dir() {
                    self.git.remove_worktree(&self.base_repo, &entry.path())?;
                }
            }
        }
        self.active.clear();
        self.git.prune_worktrees(&self.base_repo)
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(args).current_dir(dir).output().unwrap();
        }
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        Command::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn at_most_one_active_worktree_per_task() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path());
        let wt_base = TempDir::new().unwrap();

        let manager = WorktreeManager::new(
            repo_dir.path().to_path_buf(),
            wt_base.path().to_path_buf(),
            "main".to_string(),
        );
        let task_id = Uuid::new_v4();

        let first = manager.create_worktree_forced(task_id).unwrap();
        assert!(first.worktree_path.exists());

        let second = manager.create_worktree_forced(task_id).unwrap();
        assert!(second.worktree_path.exists());
        assert_eq!(manager.active.len(), 1);
    }

    #[test]
    fn cleanup_completed_task_is_idempotent() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path());
        let wt_base = TempDir::new().unwrap();

        let manager = WorktreeManager::new(
            repo_dir.path().to_path_buf(),
            wt_base.path().to_path_buf(),
            "main".to_string(),
        );
        let task_id = Uuid::new_v4();
        manager.create_worktree_forced(task_id).unwrap();

        manager.cleanup_completed_task(task_id, true).unwrap();
        manager.cleanup_completed_task(task_id, true).unwrap();
    }
}
