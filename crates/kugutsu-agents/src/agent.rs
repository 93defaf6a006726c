use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kugutsu_types::{DevelopmentResult, ReviewVerdict, Task};
use thiserror::Error;

use crate::abort::AbortSignal;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("development agent failed: {0}")]
    DevelopmentFailed(String),
    #[error("review agent failed: {0}")]
    ReviewFailed(String),
    #[error("agent call aborted")]
    Aborted,
}

/// A development agent instance: an opaque external collaborator invoked
/// once per development-queue dispatch. Runs inside the task's worktree and
/// may read/write freely there.
#[async_trait]
pub trait DevelopmentAgent: Send + Sync {
    async fn run(
        &self,
        task: &Task,
        workdir: &Path,
        abort: &AbortSignal,
    ) -> Result<DevelopmentResult, AgentError>;
}

/// A review agent instance: an opaque external collaborator invoked once per
/// review-queue dispatch, producing an approve/needs-revision verdict.
#[async_trait]
pub trait ReviewAgent: Send + Sync {
    async fn review(
        &self,
        task: &Task,
        result: &DevelopmentResult,
        abort: &AbortSignal,
    ) -> Result<ReviewVerdict, AgentError>;
}

/// Opaque identifier and callable bundle for a development agent instance.
/// Reused across revision rounds for a task; a fresh handle is created only
/// on a task's first dispatch, and the id is what flows through
/// conflict-resolution context so the same underlying agent instance keeps
/// working the same branch.
#[derive(Clone)]
pub struct EngineerHandle {
    pub id: String,
    pub agent: Arc<dyn DevelopmentAgent>,
}

impl EngineerHandle {
    pub fn new(id: String, agent: Arc<dyn DevelopmentAgent>) -> Self {
        Self { id, agent }
    }
}

impl std::fmt::Debug for EngineerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineerHandle").field("id", &self.id).finish()
    }
}
