//! Owns C1-C7 and wires them together through the event bus (pipeline
//! component C8). The coordinator is the sole central listener: queues
//! never hold a back-reference to it, they only publish events, and it
//! routes every cross-stage transition from a single subscription.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kugutsu_agents::{EngineerFactory, EngineerHandle, ReviewAgent};
use kugutsu_git::WorktreeManager;
use kugutsu_types::{FailurePhase, PipelineEvent, Priority, Task, TaskId};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::completion_reporter::CompletionReporter;
use crate::dependency_graph::{DependencyGraphError, DependencyManager};
use crate::development_queue::DevelopmentQueue;
use crate::event_bus::{EventBus, Registration};
use crate::merge_coordinator::{MergeCoordinator, MergeItem};
use crate::review_queue::{ReviewItem, ReviewQueue};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("dependency graph rejected the initial task set: {0}")]
    Graph(#[from] DependencyGraphError),
    #[error("coordinator already started")]
    AlreadyStarted,
    #[error("coordinator must be initialized before it is started")]
    NotInitialized,
}

/// Observer hooks the coordinator notifies as the run progresses. The core
/// ships [`NullObserver`]; a richer transport (progress UI, structured log
/// sink) is an external collaborator that implements this trait.
pub trait PipelineObserver: Send + Sync {
    fn on_log(&self, _message: &str) {}
    fn on_task_status(&self, _task_id: TaskId, _status: &str) {}
    fn on_engineer_count(&self, _active: usize, _max: usize) {}
    fn on_all_completed(&self, _total: usize) {}
}

/// The default observer: discards every hook. Used when the caller has no
/// progress transport to attach.
pub struct NullObserver;
impl PipelineObserver for NullObserver {}

pub struct CoordinatorStats {
    pub development: crate::task_queue::TaskQueueStats,
    pub review: crate::task_queue::TaskQueueStats,
    pub merge: crate::task_queue::TaskQueueStats,
    pub dep_summary: crate::dependency_graph::StatusSummary,
}

/// Wires the Event Bus, Dependency Manager, Worktree Manager, and the three
/// queues into one pipeline run. Construct with [`PipelineCoordinator::new`],
/// [`PipelineCoordinator::initialize`] the task set, then
/// [`PipelineCoordinator::start`] the queues.
pub struct PipelineCoordinator {
    bus: EventBus,
    dep_manager: Arc<DependencyManager>,
    worktrees: Arc<WorktreeManager>,
    dev_queue: Arc<DevelopmentQueue>,
    review_queue: Arc<ReviewQueue>,
    merge_coordinator: Option<Arc<MergeCoordinator>>,
    reporter: Arc<CompletionReporter>,
    engineers: Arc<DashMap<TaskId, EngineerHandle>>,
    observer: Arc<dyn PipelineObserver>,
    max_review_retries: u32,
    max_merge_retries: u32,
    registrations: std::sync::Mutex<Vec<Registration>>,
    started: std::sync::atomic::AtomicBool,
}

impl PipelineCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        factory: Arc<dyn EngineerFactory>,
        reviewer: Arc<dyn ReviewAgent>,
        observer: Arc<dyn PipelineObserver>,
        max_concurrent_engineers: usize,
        max_dev_retries: u32,
        max_review_retries: u32,
        max_merge_retries: u32,
    ) -> Self {
        let bus = EventBus::new();
        let dep_manager = Arc::new(DependencyManager::new());
        let engineers = Arc::new(DashMap::new());
        let reporter = Arc::new(CompletionReporter::new(&[], bus.clone()));

        let dev_queue = Arc::new(DevelopmentQueue::new(
            dep_manager.clone(),
            worktrees.clone(),
            factory,
            engineers.clone(),
            bus.clone(),
            max_concurrent_engineers,
            max_dev_retries,
        ));
        let review_queue = Arc::new(ReviewQueue::new(reviewer, bus.clone(), max_concurrent_engineers));

        Self {
            bus,
            dep_manager,
            worktrees,
            dev_queue,
            review_queue,
            merge_coordinator: None,
            reporter,
            engineers,
            observer,
            max_review_retries,
            max_merge_retries,
            registrations: std::sync::Mutex::new(Vec::new()),
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Builds the dependency graph from the initial task set, rebuilds the
    /// completion reporter against the real total, and constructs the merge
    /// coordinator against that reporter. Must be called before `start`. A
    /// nonempty cycle report aborts here with a fatal [`CoordinatorError`]
    /// rather than letting the run start against a broken graph.
    pub fn initialize(&mut self, tasks: Vec<Task>) -> Result<(), CoordinatorError> {
        let titles: Vec<(TaskId, String)> = tasks.iter().map(|t| (t.id, t.display_title().to_string())).collect();
        self.dep_manager.build_dependency_graph(tasks)?;
        self.reporter = Arc::new(CompletionReporter::new(&titles, self.bus.clone()));
        self.merge_coordinator = Some(Arc::new(MergeCoordinator::new(
            self.worktrees.clone(),
            self.reporter.clone(),
            self.bus.clone(),
            self.max_merge_retries,
        )));
        Ok(())
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn reporter(&self) -> &CompletionReporter {
        &self.reporter
    }

    pub fn dependency_manager(&self) -> &DependencyManager {
        &self.dep_manager
    }

    /// Subscribes the coordinator's own routing logic to the bus, then
    /// launches the development, review, and merge queue processors. Must be
    /// called after `initialize`. Subsequent calls are no-ops.
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let Some(merge_coordinator) = self.merge_coordinator.clone() else {
            return Err(CoordinatorError::NotInitialized);
        };
        if self.started.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(CoordinatorError::AlreadyStarted);
        }

        self.review_queue.start();
        merge_coordinator.start();
        self.dev_queue.start();

        let reg = self.subscribe_router(merge_coordinator);
        self.registrations.lock().unwrap().push(reg);

        for task in self.dep_manager.get_ready_tasks() {
            self.observer.on_task_status(task.id, "queued-for-development");
            self.dev_queue.enqueue(task.clone(), task.priority.weight());
        }

        Ok(())
    }

    /// The single central listener wiring every cross-stage transition
    /// named in the component design. Registered once in `start`.
    fn subscribe_router(&self, merge_coordinator: Arc<MergeCoordinator>) -> Registration {
        let dep_manager = self.dep_manager.clone();
        let dev_queue = self.dev_queue.clone();
        let review_queue = self.review_queue.clone();
        let engineers = self.engineers.clone();
        let observer = self.observer.clone();
        let bus = self.bus.clone();
        let max_review_retries = self.max_review_retries;

        self.bus.subscribe(move |envelope| match &envelope.event {
            PipelineEvent::DevelopmentCompleted { task, result, engineer_id } => {
                observer.on_task_status(task.id, "developed");
                review_queue.enqueue(ReviewItem {
                    task: task.clone(),
                    result: result.clone(),
                    engineer_id: engineer_id.clone(),
                });
            }

            PipelineEvent::ReviewCompleted { task_id, needs_revision: true, verdict } => {
                if review_queue.round_count(*task_id) >= max_review_retries {
                    warn!(%task_id, max_review_retries, "review retries exhausted, failing task");
                    fail_with_cascade(&dep_manager, &bus, *task_id, FailurePhase::Review, "exceeded maximum review revision rounds".to_string());
                    return;
                }

                let Some(task) = dep_manager.get_task(*task_id) else {
                    warn!(%task_id, "needs-revision for unknown task, dropping");
                    return;
                };
                let revision = task.into_revision(&verdict.comments);
                observer.on_task_status(*task_id, "revision-requested");
                dev_queue.enqueue(revision, Priority::High.weight());
            }

            PipelineEvent::ReviewCompleted { needs_revision: false, .. } => {}

            PipelineEvent::MergeReady { task, result, review_history, engineer_id } => {
                observer.on_task_status(task.id, "merge-ready");
                if let Err(e) = dep_manager.mark_merging(task.id) {
                    warn!(task_id = %task.id, error = %e, "failed to mark task merging");
                }
                merge_coordinator.enqueue(MergeItem {
                    task: task.clone(),
                    result: result.clone(),
                    review_history: review_history.clone(),
                    engineer_id: engineer_id.clone(),
                    retry_count: 0,
                });
            }

            PipelineEvent::MergeConflictDetected { task, result, review_history, engineer_id, conflicted_files } => {
                info!(task_id = %task.id, ?conflicted_files, "routing merge conflict back to development");
                let conflict_task = Task::into_conflict_resolution(
                    task,
                    engineer_id.clone(),
                    result.clone(),
                    review_history.clone(),
                    conflicted_files.clone(),
                );
                observer.on_task_status(task.id, "conflict-resolution-dispatched");
                dev_queue.enqueue(conflict_task, Priority::High.weight());
            }

            PipelineEvent::MergeCompleted { task_id, success: true, .. } => {
                engineers.remove(task_id);
                match dep_manager.mark_merged(*task_id) {
                    Ok(newly_ready) => {
                        let newly_ready_ids: Vec<TaskId> = newly_ready.iter().map(|t| t.id).collect();
                        bus.publish(PipelineEvent::DependencyResolved {
                            task_id: *task_id,
                            newly_ready: newly_ready_ids,
                        });
                        for mut task in newly_ready {
                            task.force_fresh_workspace = true;
                            observer.on_task_status(task.id, "dependency-resolved");
                            let priority = task.priority.weight();
                            dev_queue.enqueue(task, priority);
                        }
                    }
                    Err(e) => warn!(%task_id, error = %e, "failed to mark task merged"),
                }
            }

            PipelineEvent::MergeCompleted { task_id, success: false, .. } => {
                engineers.remove(task_id);
                fail_with_cascade(&dep_manager, &bus, *task_id, FailurePhase::Merge, "final merge exhausted retries".to_string());
            }

            PipelineEvent::TaskFailed { task_id, phase, reason } => {
                observer.on_task_status(*task_id, &format!("failed:{phase:?}"));
                observer.on_log(&format!("task {task_id} failed in {phase:?}: {reason}"));
            }

            PipelineEvent::TaskCompleted { task_id, completed, total, .. } => {
                observer.on_task_status(*task_id, "completed");
                observer.on_engineer_count(*completed, *total);
            }

            PipelineEvent::AllTasksCompleted { total } => {
                observer.on_all_completed(*total);
            }

            PipelineEvent::DependencyResolved { .. } => {}
        })
    }

    /// Stops accepting new work on every queue; in-flight items are allowed
    /// to finish.
    pub fn stop(&self) {
        self.dev_queue.stop();
        self.review_queue.stop();
        if let Some(merge) = &self.merge_coordinator {
            merge.stop();
        }
    }

    /// Waits until all three queues report idle and no task remains in a
    /// non-terminal state, polling at a short interval and emitting stats
    /// for observability while it waits.
    pub async fn wait_for_completion(&self) {
        loop {
            self.dev_queue.wait_for_completion().await;
            self.review_queue.wait_for_completion().await;
            if let Some(merge) = &self.merge_coordinator {
                merge.wait_for_completion().await;
            }

            let summary = self.dep_manager.get_status_summary();
            let pending = summary.waiting + summary.ready + summary.running + summary.developed + summary.merging;
            if pending == 0 {
                return;
            }

            let stats = self.stats();
            self.observer.on_log(&format!(
                "waiting: dev={}/{} review={}/{} merge={}/{} pending-tasks={pending}",
                stats.development.waiting + stats.development.processing,
                stats.development.max_concurrent,
                stats.review.waiting + stats.review.processing,
                stats.review.max_concurrent,
                stats.merge.waiting + stats.merge.processing,
                stats.merge.max_concurrent,
            ));
            sleep(Duration::from_millis(200)).await;
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        let merge = self
            .merge_coordinator
            .as_ref()
            .map(|m| m.stats())
            .unwrap_or(crate::task_queue::TaskQueueStats { waiting: 0, processing: 0, max_concurrent: 1 });
        CoordinatorStats {
            development: self.dev_queue.stats(),
            review: self.review_queue.stats(),
            merge,
            dep_summary: self.dep_manager.get_status_summary(),
        }
    }

    /// Releases core-owned bus subscriptions and sweeps every outstanding
    /// worktree. Call after `wait_for_completion` returns.
    pub fn cleanup(&self, delete_branches: bool) {
        for reg in self.registrations.lock().unwrap().drain(..) {
            reg.unregister();
        }
        self.engineers.clear();
        if let Err(e) = self.worktrees.cleanup_all(delete_branches) {
            warn!(error = %e, "failed to sweep worktrees during coordinator cleanup");
        }
    }

    /// (id, title) for every task left in the FAILED state, for the CLI's
    /// end-of-run summary.
    pub fn failed_tasks(&self) -> Vec<(TaskId, String)> {
        self.dep_manager.failed_tasks()
    }
}

fn fail_with_cascade(
    dep_manager: &DependencyManager,
    bus: &EventBus,
    task_id: TaskId,
    phase: FailurePhase,
    reason: String,
) {
    let cascaded = dep_manager.mark_failed(task_id).unwrap_or_default();
    bus.publish(PipelineEvent::TaskFailed { task_id, phase, reason: reason.clone() });
    for dependent_id in cascaded {
        bus.publish(PipelineEvent::TaskFailed {
            task_id: dependent_id,
            phase: FailurePhase::Cascade,
            reason: format!("upstream task {task_id} failed: {reason}"),
        });
    }
}
