//! Concrete development/review/engineer-factory collaborators for standalone
//! runs of the binary. The real coding agent is an external collaborator
//! outside this crate's scope (see `kugutsu-agents`); this module supplies a
//! shell-command-backed stand-in so the pipeline is runnable end to end
//! without one.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use kugutsu_agents::{AbortSignal, AgentError, DevelopmentAgent, EngineerFactory, EngineerHandle, ReviewAgent};
use kugutsu_git::GitCli;
use kugutsu_types::{DevelopmentResult, ReviewVerdict, Task};
use tokio::process::Command;
use tracing::{info, warn};

/// Runs a configured shell command inside the task's worktree as the
/// development step, exposing the task to the command via environment
/// variables. Exit code 0 is success; changed files are read back from
/// `git status --porcelain` afterwards.
pub struct ShellDevelopmentAgent {
    command: String,
}

impl ShellDevelopmentAgent {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl DevelopmentAgent for ShellDevelopmentAgent {
    async fn run(&self, task: &Task, workdir: &Path, abort: &AbortSignal) -> Result<DevelopmentResult, AgentError> {
        if abort.is_aborted() {
            return Err(AgentError::Aborted);
        }

        info!(task_id = %task.id, command = %self.command, path = %workdir.display(), "running shell development agent");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(workdir)
            .env("KUGUTSU_TASK_ID", task.id.to_string())
            .env("KUGUTSU_TASK_TITLE", task.display_title())
            .env("KUGUTSU_TASK_DESCRIPTION", &task.description)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AgentError::DevelopmentFailed(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let files_changed = GitCli::new()
            .status_porcelain(workdir)
            .map(|entries| entries.into_iter().map(|e| e.path).collect())
            .unwrap_or_else(|e| {
                warn!(task_id = %task.id, error = %e, "could not read back changed files");
                Vec::new()
            });

        if output.status.success() {
            Ok(DevelopmentResult {
                success: true,
                files_changed,
                output: stdout,
                error: None,
            })
        } else {
            let error = if stderr.is_empty() {
                format!("agent command exited with {}", output.status)
            } else {
                stderr
            };
            Ok(DevelopmentResult {
                success: false,
                files_changed,
                output: stdout,
                error: Some(error),
            })
        }
    }
}

/// Creates a [`ShellDevelopmentAgent`] per task, all sharing the same
/// configured command. The factory is only ever consulted once per task;
/// the resulting handle is reused across that task's revision rounds.
pub struct ShellEngineerFactory {
    command: String,
}

impl ShellEngineerFactory {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

impl EngineerFactory for ShellEngineerFactory {
    fn create(&self, task: &Task) -> EngineerHandle {
        EngineerHandle::new(
            format!("engineer-{}", task.id),
            std::sync::Arc::new(ShellDevelopmentAgent::new(self.command.clone())),
        )
    }
}

/// Approves every development result it sees. The development queue only
/// ever publishes `development-completed` for a run that itself reported
/// success, so there is nothing left here to gate on without a real review
/// collaborator; this stands in for one on local runs.
pub struct AutoApproveReviewAgent;

#[async_trait]
impl ReviewAgent for AutoApproveReviewAgent {
    async fn review(&self, task: &Task, _result: &DevelopmentResult, abort: &AbortSignal) -> Result<ReviewVerdict, AgentError> {
        if abort.is_aborted() {
            return Err(AgentError::Aborted);
        }
        info!(task_id = %task.id, "auto-approving development result");
        Ok(ReviewVerdict {
            approved: true,
            comments: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use kugutsu_types::{Priority, TaskKind};
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
        Command::new("git").args(["commit", "-m", "initial"]).current_dir(dir).output().unwrap();
    }

    fn sample_task() -> Task {
        Task::new(Uuid::new_v4(), "write file", "touch a file", TaskKind::Feature, Priority::Medium, vec![])
    }

    #[tokio::test]
    async fn successful_command_reports_changed_files() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let agent = ShellDevelopmentAgent::new("echo hi > out.txt".to_string());
        let abort = AbortSignal::new();

        let result = agent.run(&sample_task(), repo.path(), &abort).await.unwrap();

        assert!(result.success);
        assert!(result.files_changed.iter().any(|f| f == "out.txt"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn failing_command_reports_failure_with_stderr() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let agent = ShellDevelopmentAgent::new("echo boom 1>&2; exit 1".to_string());
        let abort = AbortSignal::new();

        let result = agent.run(&sample_task(), repo.path(), &abort).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom\n"));
    }

    #[tokio::test]
    async fn aborted_signal_short_circuits_before_running_the_command() {
        let repo = TempDir::new().unwrap();
        init_repo(repo.path());
        let agent = ShellDevelopmentAgent::new("echo should-not-run > marker.txt".to_string());
        let abort = AbortSignal::new();
        abort.abort();

        let err = agent.run(&sample_task(), repo.path(), &abort).await.unwrap_err();

        assert!(matches!(err, AgentError::Aborted));
        assert!(!repo.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn factory_produces_a_handle_bound_to_the_task_id() {
        let factory = ShellEngineerFactory::new("true".to_string());
        let task = sample_task();
        let handle = factory.create(&task);
        assert_eq!(handle.id, format!("engineer-{}", task.id));
    }

    #[tokio::test]
    async fn auto_approve_always_approves() {
        let task = sample_task();
        let result = DevelopmentResult { success: true, files_changed: vec![], output: String::new(), error: None };
        let abort = AbortSignal::new();
        let verdict = AutoApproveReviewAgent.review(&task, &result, &abort).await.unwrap();
        assert!(verdict.approved);
    }
}
