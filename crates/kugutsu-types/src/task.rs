use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = Uuid;

/// The kind of work a task represents.
///
/// `ConflictResolution` is synthesized by the coordinator in response to a
/// merge conflict; it never comes from the task source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Feature,
    Bugfix,
    Refactor,
    Test,
    Docs,
    ConflictResolution,
}

/// Scheduling priority. Maps to a numeric weight used for queue ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric weight used by the task queues for descending-priority ordering.
    pub fn weight(self) -> i32 {
        match self {
            Priority::High => 50,
            Priority::Medium => 0,
            Priority::Low => -50,
        }
    }
}

/// Where a task's isolated workspace lives, once bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBinding {
    pub branch_name: String,
    pub worktree_path: PathBuf,
}

/// Result of a development agent run, carried through review and merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevelopmentResult {
    pub success: bool,
    pub files_changed: Vec<String>,
    pub output: String,
    pub error: Option<String>,
}

/// A single review verdict accumulated in a task's review history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    pub comments: Vec<String>,
}

/// Context carried by a conflict-resolution task variant, linking it back to
/// the original task whose merge hit unresolved conflict markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictContext {
    pub original_task_id: TaskId,
    pub original_engineer_id: String,
    pub original_result: DevelopmentResult,
    pub review_history: Vec<ReviewVerdict>,
    pub conflicted_files: Vec<String>,
}

/// The unit scheduled through the Develop -> Review -> Merge pipeline.
///
/// Lifecycle state (WAITING/READY/.../MERGED/FAILED) is intentionally not a
/// field here: it is owned exclusively by the dependency manager so that
/// state transitions never race with task identity mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub origin_task_id: Option<TaskId>,
    pub kind: TaskKind,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub workspace: Option<WorkspaceBinding>,
    pub force_fresh_workspace: bool,
    pub conflict_context: Option<ConflictContext>,
}

impl Task {
    /// A fresh, non-synthetic task as produced by a task source.
    pub fn new(
        id: TaskId,
        title: impl Into<String>,
        description: impl Into<String>,
        kind: TaskKind,
        priority: Priority,
        dependencies: Vec<TaskId>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
            origin_task_id: None,
            kind,
            priority,
            dependencies,
            workspace: None,
            force_fresh_workspace: false,
            conflict_context: None,
        }
    }

    pub fn is_conflict_resolution(&self) -> bool {
        self.kind == TaskKind::ConflictResolution
    }

    /// The display title, with any `[revision] `/`[conflict-resolution] `
    /// prefix stripped, so completion and reporting stay keyed to the
    /// original task's identity.
    pub fn display_title(&self) -> &str {
        self.title
            .strip_prefix("[conflict-resolution] ")
            .or_else(|| self.title.strip_prefix("[revision] "))
            .unwrap_or(&self.title)
    }

    /// Builds a revision variant of this task after a needs-revision review.
    /// Keeps the same id so review rounds and the engineer handle carry over.
    pub fn into_revision(mut self, comments: &[String]) -> Self {
        let base_title = self.display_title().to_string();
        self.title = format!("[revision] {base_title}");
        if !comments.is_empty() {
            self.description = format!(
                "{}\n\nReviewer feedback:\n{}",
                self.description,
                comments
                    .iter()
                    .map(|c| format!("- {c}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
        }
        self.force_fresh_workspace = false;
        self
    }

    /// Builds the synthetic conflict-resolution variant the coordinator
    /// re-enqueues to the development stage after a merge conflict.
    pub fn into_conflict_resolution(
        original: &Task,
        engineer_id: String,
        result: DevelopmentResult,
        review_history: Vec<ReviewVerdict>,
        conflicted_files: Vec<String>,
    ) -> Self {
        Task {
            id: original.id,
            title: format!("[conflict-resolution] {}", original.display_title()),
            description: original.description.clone(),
            origin_task_id: Some(original.id),
            kind: TaskKind::ConflictResolution,
            priority: Priority::High,
            dependencies: original.dependencies.clone(),
            workspace: original.workspace.clone(),
            force_fresh_workspace: false,
            conflict_context: Some(ConflictContext {
                original_task_id: original.id,
                original_engineer_id: engineer_id,
                original_result: result,
                review_history,
                conflicted_files,
            }),
        }
    }
}

/// Lifecycle state of a task, owned by the dependency manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Ready,
    Running,
    Developed,
    Merging,
    Merged,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Merged | TaskState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task::new(Uuid::new_v4(), "add login form", "wire up the form", TaskKind::Feature, Priority::Medium, vec![])
    }

    #[test]
    fn priority_weights_are_descending() {
        assert!(Priority::High.weight() > Priority::Medium.weight());
        assert!(Priority::Medium.weight() > Priority::Low.weight());
    }

    #[test]
    fn display_title_strips_revision_prefix() {
        let revised = sample().into_revision(&["add tests".to_string()]);
        assert_eq!(revised.title, "[revision] add login form");
        assert_eq!(revised.display_title(), "add login form");
        assert!(revised.description.contains("add tests"));
    }

    #[test]
    fn display_title_strips_conflict_resolution_prefix() {
        let original = sample();
        let conflict = Task::into_conflict_resolution(
            &original,
            "engineer-1".to_string(),
            DevelopmentResult { success: true, files_changed: vec![], output: String::new(), error: None },
            vec![],
            vec!["src/lib.rs".to_string()],
        );
        assert_eq!(conflict.display_title(), "add login form");
        assert!(conflict.is_conflict_resolution());
        assert_eq!(conflict.id, original.id, "conflict-resolution variant keeps the original task id");
        assert_eq!(conflict.conflict_context.unwrap().original_task_id, original.id);
    }

    #[test]
    fn revision_of_a_revision_does_not_stack_prefixes() {
        let once = sample().into_revision(&[]);
        let twice = once.into_revision(&["still missing tests".to_string()]);
        assert_eq!(twice.title, "[revision] add login form");
    }

    #[test]
    fn fresh_task_is_not_conflict_resolution() {
        assert!(!sample().is_conflict_resolution());
    }
}
