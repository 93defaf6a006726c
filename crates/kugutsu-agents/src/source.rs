use async_trait::async_trait;
use kugutsu_types::{Priority, TaskId, TaskKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskSourceError {
    #[error("task source failed: {0}")]
    Failed(String),
    #[error("task source produced no tasks")]
    Empty,
}

/// A task as handed over by the planning agent, before dependency
/// references (which may be ids or titles) have been resolved to ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTask {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub kind: TaskKind,
    pub priority: Priority,
    /// Dependency references: either a task id or another task's title.
    /// Resolved to ids when the dependency graph is built.
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSourceOutput {
    pub tasks: Vec<RawTask>,
    pub summary: String,
    pub project_id: String,
}

/// The planning agent that turns a free-text user request into a list of
/// tasks. Treated as an opaque external collaborator: the core only
/// validates and builds the dependency graph from its output.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch(&self, user_request: &str) -> Result<TaskSourceOutput, TaskSourceError>;
}

/// A task source that replays a fixed, pre-planned task list. Used by the
/// CLI binary in place of a real planning agent (out of scope per the
/// core's external-interface boundary) and by tests.
pub struct FixtureTaskSource {
    output: TaskSourceOutput,
}

impl FixtureTaskSource {
    pub fn new(output: TaskSourceOutput) -> Self {
        Self { output }
    }
}

#[async_trait]
impl TaskSource for FixtureTaskSource {
    async fn fetch(&self, _user_request: &str) -> Result<TaskSourceOutput, TaskSourceError> {
        if self.output.tasks.is_empty() {
            return Err(TaskSourceError::Empty);
        }
        Ok(self.output.clone())
    }
}
