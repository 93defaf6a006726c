//! Shared types for the Kugutsu pipeline core: the task model, lifecycle
//! states, and the closed set of events the pipeline components exchange.

pub mod events;
pub mod task;

pub use events::{EventEnvelope, FailurePhase, PipelineEvent};
pub use task::{
    ConflictContext, DevelopmentResult, Priority, ReviewVerdict, Task, TaskId, TaskKind,
    TaskState, WorkspaceBinding,
};
