use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{DevelopmentResult, ReviewVerdict, Task, TaskId};

/// The phase a task-failed event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Development,
    Review,
    Merge,
    /// Marked failed only because an upstream dependency failed.
    Cascade,
}

/// The closed set of typed payloads the event bus carries. Each variant
/// corresponds 1:1 to one of the event kinds named in the component design.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PipelineEvent {
    DevelopmentCompleted {
        task: Task,
        result: DevelopmentResult,
        engineer_id: String,
    },
    ReviewCompleted {
        task_id: TaskId,
        needs_revision: bool,
        verdict: ReviewVerdict,
    },
    MergeReady {
        task: Task,
        result: DevelopmentResult,
        review_history: Vec<ReviewVerdict>,
        engineer_id: String,
    },
    MergeConflictDetected {
        task: Task,
        result: DevelopmentResult,
        review_history: Vec<ReviewVerdict>,
        engineer_id: String,
        conflicted_files: Vec<String>,
    },
    MergeCompleted {
        task_id: TaskId,
        title: String,
        success: bool,
        merge_commit: Option<String>,
    },
    TaskFailed {
        task_id: TaskId,
        phase: FailurePhase,
        reason: String,
    },
    TaskCompleted {
        task_id: TaskId,
        title: String,
        completed: usize,
        total: usize,
        percentage: f64,
    },
    DependencyResolved {
        task_id: TaskId,
        newly_ready: Vec<TaskId>,
    },
    AllTasksCompleted {
        total: usize,
    },
}

impl PipelineEvent {
    /// The event kind as a stable string, used for tracing fields and for
    /// subscribers that only care about dispatching on kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            PipelineEvent::DevelopmentCompleted { .. } => "development-completed",
            PipelineEvent::ReviewCompleted { .. } => "review-completed",
            PipelineEvent::MergeReady { .. } => "merge-ready",
            PipelineEvent::MergeConflictDetected { .. } => "merge-conflict-detected",
            PipelineEvent::MergeCompleted { .. } => "merge-completed",
            PipelineEvent::TaskFailed { .. } => "task-failed",
            PipelineEvent::TaskCompleted { .. } => "task-completed",
            PipelineEvent::DependencyResolved { .. } => "dependency-resolved",
            PipelineEvent::AllTasksCompleted { .. } => "all-tasks-completed",
        }
    }
}

/// An event plus the wall-clock time it was published, as delivered to
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: PipelineEvent,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn kind_name_matches_the_serde_tag() {
        let task_id = Uuid::new_v4();
        let event = PipelineEvent::TaskFailed {
            task_id,
            phase: FailurePhase::Development,
            reason: "boom".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], event.kind_name());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = EventEnvelope {
            event: PipelineEvent::AllTasksCompleted { total: 3 },
            at: Utc::now(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert!(matches!(back.event, PipelineEvent::AllTasksCompleted { total: 3 }));
    }

    #[test]
    fn dependency_resolved_carries_newly_ready_ids() {
        let task_id = Uuid::new_v4();
        let dependent = Uuid::new_v4();
        let event = PipelineEvent::DependencyResolved { task_id, newly_ready: vec![dependent] };
        assert_eq!(event.kind_name(), "dependency-resolved");
        match event {
            PipelineEvent::DependencyResolved { newly_ready, .. } => assert_eq!(newly_ready, vec![dependent]),
            _ => unreachable!(),
        }
    }
}
