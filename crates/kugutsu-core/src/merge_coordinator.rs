//! Serialized merge queue (pipeline component C5): brings the base branch
//! into a feature branch, detects conflicts, performs the final merge, and
//! cleans up. Built on [`TaskQueue`] with `max_concurrent = 1` so at most
//! one Step-3 final merge is ever in flight.

use std::sync::Arc;
use std::time::Duration;

use kugutsu_git::{BaseIntoFeatureOutcome, GitService, GitServiceError};
use kugutsu_git::WorktreeManager;
use kugutsu_types::{DevelopmentResult, PipelineEvent, ReviewVerdict, Task, TaskId};
use tracing::{info, warn};

use crate::completion_reporter::CompletionReporter;
use crate::event_bus::EventBus;
use crate::task_queue::{Outcome, QueueItem, TaskQueue};

/// One unit of merge work: a task whose development result was approved by
/// review and is now waiting for its turn at the base branch.
#[derive(Clone)]
pub struct MergeItem {
    pub task: Task,
    pub result: DevelopmentResult,
    pub review_history: Vec<ReviewVerdict>,
    pub engineer_id: String,
    pub retry_count: u32,
}

impl QueueItem for MergeItem {
    fn id(&self) -> TaskId {
        self.task.id
    }
}

fn commit_message(task: &Task) -> String {
    format!("{}\n\nkugutsu: merged task {}", task.display_title(), task.id)
}

pub struct MergeCoordinator {
    queue: TaskQueue<MergeItem>,
    git: GitService,
    worktrees: Arc<WorktreeManager>,
    reporter: Arc<CompletionReporter>,
    bus: EventBus,
    max_merge_retries: u32,
    stabilization: Duration,
}

impl MergeCoordinator {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        reporter: Arc<CompletionReporter>,
        bus: EventBus,
        max_merge_retries: u32,
    ) -> Self {
        Self {
            queue: TaskQueue::new("merge", 1),
            git: GitService::new(),
            worktrees,
            reporter,
            bus,
            max_merge_retries,
            stabilization: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_stabilization(mut self, d: Duration) -> Self {
        self.stabilization = d;
        self
    }

    pub fn enqueue(&self, item: MergeItem) {
        self.queue.enqueue(item, 0);
    }

    pub fn stop(&self) {
        self.queue.stop();
    }

    pub async fn wait_for_completion(&self) {
        self.queue.wait_for_completion().await;
    }

    pub fn stats(&self) -> crate::task_queue::TaskQueueStats {
        self.queue.stats()
    }

    pub fn start(&self) {
        let git = self.git.clone();
        let worktrees = self.worktrees.clone();
        let reporter = self.reporter.clone();
        let bus = self.bus.clone();
        let max_merge_retries = self.max_merge_retries;
        let stabilization = self.stabilization;

        self.queue.start(Arc::new(move |item: MergeItem| {
            let git = git.clone();
            let worktrees = worktrees.clone();
            let reporter = reporter.clone();
            let bus = bus.clone();
            Box::pin(async move {
                let outcome = process_one(&git, &worktrees, &reporter, &bus, item, max_merge_retries).await;
                tokio::time::sleep(stabilization).await;
                outcome
            })
        }));
    }
}

async fn process_one(
    git: &GitService,
    worktrees: &WorktreeManager,
    reporter: &CompletionReporter,
    bus: &EventBus,
    item: MergeItem,
    max_merge_retries: u32,
) -> Outcome<MergeItem> {
    let MergeItem { task, result, review_history, engineer_id, retry_count } = item;
    let task_id = task.id;

    let binding = match worktrees.binding_for(task_id) {
        Some(b) => b,
        None => {
            warn!(%task_id, "merge item has no worktree binding, dropping");
            return Outcome::Failed;
        }
    };

    info!(%task_id, "merge step 1: bring base into feature");
    let bring_in = git.bring_base_into_feature(&binding.worktree_path, worktrees.base_branch());
    match bring_in {
        Ok(BaseIntoFeatureOutcome::Clean) => {}
        Ok(BaseIntoFeatureOutcome::Conflicted { files }) => {
            info!(%task_id, ?files, "merge step 2: conflict detected, routing back to development");
            bus.publish(PipelineEvent::MergeConflictDetected {
                task,
                result,
                review_history,
                engineer_id,
                conflicted_files: files,
            });
            return Outcome::Completed;
        }
        Err(e) => {
            warn!(%task_id, error = %e, "bring-base-into-feature failed outside of conflicts");
            let _ = git.abort_merge(&binding.worktree_path);
            return retry_or_give_up(task, result, review_history, engineer_id, retry_count, max_merge_retries, bus);
        }
    }

    info!(%task_id, "merge step 3: final merge into base");
    let final_result = git.final_merge(
        worktrees.base_repo(),
        &binding.branch_name,
        worktrees.base_branch(),
        &commit_message(&task),
    );

    match final_result {
        Ok(commit) => {
            info!(%task_id, %commit, "merge step 4: success");
            bus.publish(PipelineEvent::MergeCompleted {
                task_id,
                title: task.display_title().to_string(),
                success: true,
                merge_commit: Some(commit),
            });
            let delete_branch = !task.is_conflict_resolution();
            if let Err(e) = worktrees.cleanup_completed_task(task_id, delete_branch) {
                warn!(%task_id, error = %e, "failed to clean up worktree after successful merge");
            }
            reporter.mark_task_completed(task_id, task.display_title());
            Outcome::Completed
        }
        Err(e) => {
            warn!(%task_id, error = %e, retry_count, "merge step 5: final merge failed");
            let _ = abort_final_merge(git, worktrees.base_repo());
            retry_or_give_up(task, result, review_history, engineer_id, retry_count, max_merge_retries, bus)
        }
    }
}

fn abort_final_merge(git: &GitService, base_repo: &std::path::Path) -> Result<(), GitServiceError> {
    git.abort_merge(base_repo)
}

fn retry_or_give_up(
    task: Task,
    result: DevelopmentResult,
    review_history: Vec<ReviewVerdict>,
    engineer_id: String,
    retry_count: u32,
    max_merge_retries: u32,
    bus: &EventBus,
) -> Outcome<MergeItem> {
    let task_id = task.id;
    if retry_count + 1 >= max_merge_retries {
        warn!(%task_id, "final merge exhausted retries, giving up");
        bus.publish(PipelineEvent::MergeCompleted {
            task_id,
            title: task.display_title().to_string(),
            success: false,
            merge_commit: None,
        });
        return Outcome::Failed;
    }
    Outcome::Requeue {
        item: MergeItem { task, result, review_history, engineer_id, retry_count: retry_count + 1 },
        priority: 0,
    }
}
