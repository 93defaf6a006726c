//! Thin wrapper around the `git` executable.
//!
//! The pipeline core deliberately shells out to the real `git` binary for
//! every working-tree-mutating operation (worktree add/remove, checkout,
//! merge, merge --abort) instead of reimplementing those semantics over
//! libgit2: the CLI already enforces the safety checks (refusing to clobber
//! uncommitted changes, handling sparse checkouts, etc.) that a hand-rolled
//! libgit2 equivalent would have to duplicate.

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::{Command, Stdio},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitCliError {
    #[error("git executable not found or not runnable")]
    NotAvailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("branch or reference not found: {0}")]
    InvalidReference(String),
}

#[derive(Clone, Default)]
pub struct GitCli;

/// One entry from `git status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub xy: String,
    pub path: String,
}

impl StatusEntry {
    /// True for the three unresolved-merge marker prefixes the pipeline
    /// treats as conflicts: `UU `, `AA `, `DD `.
    pub fn is_conflict_marker(&self) -> bool {
        matches!(self.xy.as_str(), "UU" | "AA" | "DD")
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    fn ensure_available(&self) -> Result<(), GitCliError> {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .map_err(|_| GitCliError::NotAvailable)
            .and_then(|ok| if ok { Ok(()) } else { Err(GitCliError::NotAvailable) })
    }

    /// Run `git -C <repo_path> <args...>` and return stdout on success.
    fn git<I, S>(&self, repo_path: &Path, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.ensure_available()?;
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo_path);
        for a in args {
            cmd.arg(a);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::trace!(repo = ?repo_path, ?cmd, "running git command");

        let out = cmd
            .output()
            .map_err(|e| GitCliError::CommandFailed(e.to_string()))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if stderr.contains("invalid reference:") || stderr.contains("unknown revision") {
                return Err(GitCliError::InvalidReference(stderr));
            }
            return Err(GitCliError::CommandFailed(stderr));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    pub fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec![
            "worktree".into(),
            "add".into(),
            "-b".into(),
            OsString::from(branch),
            worktree_path.as_os_str().into(),
            OsString::from(base_branch),
        ];
        self.git(repo_path, args.drain(..))?;
        Ok(())
    }

    pub fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<(), GitCliError> {
        let mut args: Vec<OsString> = vec!["worktree".into(), "remove".into()];
        if force {
            args.push("--force".into());
        }
        args.push(worktree_path.as_os_str().into());
        self.git(repo_path, args)?;
        Ok(())
    }

    pub fn worktree_prune(&self, repo_path: &Path) -> Result<(), GitCliError> {
        self.git(repo_path, ["worktree", "prune"])?;
        Ok(())
    }

    pub fn branch_delete(&self, repo_path: &Path, branch: &str, force: bool) -> Result<(), GitCliError> {
        let flag = if force { "-D" } else { "-d" };
        self.git(repo_path, ["branch", flag, branch])?;
        Ok(())
    }

    pub fn checkout(&self, repo_path: &Path, branch: &str) -> Result<(), GitCliError> {
        self.git(repo_path, ["checkout", branch])?;
        Ok(())
    }

    /// `git merge <base_branch>` in the task worktree: brings the current
    /// base tip into the feature branch.
    pub fn merge(&self, worktree_path: &Path, ref_name: &str) -> Result<(), GitCliError> {
        self.git(worktree_path, ["merge", "--no-edit", ref_name])?;
        Ok(())
    }

    /// `git merge --no-ff <branch> -m <message>` in the base repo working
    /// directory: the final merge commit.
    pub fn merge_no_ff(
        &self,
        repo_path: &Path,
        branch: &str,
        message: &str,
    ) -> Result<String, GitCliError> {
        self.git(repo_path, ["merge", "--no-ff", "-m", message, branch])?;
        self.git(repo_path, ["rev-parse", "HEAD"])
    }

    pub fn merge_abort(&self, worktree_path: &Path) -> Result<(), GitCliError> {
        self.git(worktree_path, ["merge", "--abort"])?;
        Ok(())
    }

    pub fn is_merge_in_progress(&self, worktree_path: &Path) -> bool {
        self.git(worktree_path, ["rev-parse", "-q", "--verify", "MERGE_HEAD"])
            .is_ok()
    }

    /// `git status --porcelain`, parsed into structured entries.
    pub fn status_porcelain(&self, worktree_path: &Path) -> Result<Vec<StatusEntry>, GitCliError> {
        let out = self.git(worktree_path, ["status", "--porcelain"])?;
        Ok(out
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| StatusEntry {
                xy: l[0..2].to_string(),
                path: l[3..].trim().to_string(),
            })
            .collect())
    }

    pub fn rev_parse(&self, repo_path: &Path, rev: &str) -> Result<String, GitCliError> {
        self.git(repo_path, ["rev-parse", rev])
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use tempfile::TempDir;

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
    fn worktree_add_and_remove_round_trips() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path());
        let wt_dir = TempDir::new().unwrap();
        let wt_path = wt_dir.path().join("task-1");

        let cli = GitCli::new();
        cli.worktree_add(repo_dir.path(), &wt_path, "feature/task-1", "main")
            .unwrap();
        assert!(wt_path.join("README.md").exists());

        cli.worktree_remove(repo_dir.path(), &wt_path, true).unwrap();
        assert!(!wt_path.exists());
    }

    #[test]
    fn status_porcelain_parses_conflict_marker() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path());
        let cli = GitCli::new();
        std::fs::write(repo_dir.path().join("new.txt"), "x").unwrap();
        let entries = cli.status_porcelain(repo_dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "new.txt");
        assert!(!entries[0].is_conflict_marker());
    }
}
