//! Dispatches a development agent per ready task (pipeline component C7).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kugutsu_agents::{AbortSignal, DevelopmentAgent, EngineerFactory, EngineerHandle};
use kugutsu_git::WorktreeManager;
use kugutsu_types::{FailurePhase, PipelineEvent, Task, TaskId};
use tracing::{info, warn};

use crate::dependency_graph::DependencyManager;
use crate::event_bus::EventBus;
use crate::task_queue::{Outcome, QueueItem, TaskQueue};

#[derive(Clone)]
pub struct DevelopmentItem {
    pub task: Task,
    pub retry_count: u32,
}

impl QueueItem for DevelopmentItem {
    fn id(&self) -> TaskId {
        self.task.id
    }
}

pub struct DevelopmentQueue {
    queue: TaskQueue<DevelopmentItem>,
    dep_manager: Arc<DependencyManager>,
    worktrees: Arc<WorktreeManager>,
    factory: Arc<dyn EngineerFactory>,
    engineers: Arc<DashMap<TaskId, EngineerHandle>>,
    bus: EventBus,
    max_dev_retries: u32,
}

impl DevelopmentQueue {
    pub fn new(
        dep_manager: Arc<DependencyManager>,
        worktrees: Arc<WorktreeManager>,
        factory: Arc<dyn EngineerFactory>,
        engineers: Arc<DashMap<TaskId, EngineerHandle>>,
        bus: EventBus,
        max_concurrent: usize,
        max_dev_retries: u32,
    ) -> Self {
        Self {
            queue: TaskQueue::new("development", max_concurrent),
            dep_manager,
            worktrees,
            factory,
            engineers,
            bus,
            max_dev_retries,
        }
    }

    /// Priority mapping from task priority (high=+50/medium=0/low=-50), or
    /// the caller's own override for requeues after a transient block.
    pub fn enqueue(&self, task: Task, priority: i32) {
        self.queue.enqueue(DevelopmentItem { task, retry_count: 0 }, priority);
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
        let dep_manager = self.dep_manager.clone();
        let worktrees = self.worktrees.clone();
        let factory = self.factory.clone();
        let engineers = self.engineers.clone();
        let bus = self.bus.clone();
        let max_dev_retries = self.max_dev_retries;

        self.queue.start(Arc::new(move |item: DevelopmentItem| {
            let dep_manager = dep_manager.clone();
            let worktrees = worktrees.clone();
            let factory = factory.clone();
            let engineers = engineers.clone();
            let bus = bus.clone();
            Box::pin(async move { process_one(item, &dep_manager, &worktrees, &*factory, &engineers, &bus, max_dev_retries).await })
        }));
    }
}

async fn process_one(
    item: DevelopmentItem,
    dep_manager: &DependencyManager,
    worktrees: &WorktreeManager,
    factory: &dyn EngineerFactory,
    engineers: &DashMap<TaskId, EngineerHandle>,
    bus: &EventBus,
    max_dev_retries: u32,
) -> Outcome<DevelopmentItem> {
    let DevelopmentItem { task, retry_count } = item;
    let task_id = task.id;

    // Step 1: re-verify readiness. A transient block (race between this
    // pick and a still-in-flight dependency merge) is not an error: requeue
    // at very low priority and let the queue re-pick it once the graph
    // advances, rather than spinning synchronously here.
    match dep_manager.get_task_dependency_status(task_id) {
        Ok(status) if !status.ready_now => {
            if !status.blocked_by.is_empty() {
                warn!(%task_id, ?status.blocked_by, "task permanently blocked by a failed dependency");
                return Outcome::Failed;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Outcome::Requeue { item: DevelopmentItem { task, retry_count }, priority: -100 };
        }
        Err(e) => {
            warn!(%task_id, error = %e, "dependency status lookup failed, dropping item");
            return Outcome::Failed;
        }
        _ => {}
    }

    if let Err(e) = dep_manager.mark_running(task_id) {
        warn!(%task_id, error = %e, "failed to mark task running");
        return Outcome::Failed;
    }

    // Step 2: ensure a worktree, forcing a fresh one off the current base
    // tip if this dispatch followed a dependency merge.
    let binding = if task.force_fresh_workspace {
        worktrees.create_worktree_forced(task_id)
    } else {
        worktrees.ensure_worktree(task_id)
    };
    let binding = match binding {
        Ok(b) => b,
        Err(e) => {
            warn!(%task_id, error = %e, "failed to provision worktree");
            return fail_task(task, dep_manager, worktrees, engineers, bus, FailurePhase::Development, e.to_string());
        }
    };

    // Step 3: obtain or create an engineer handle, stable across revisions.
    let engineer = engineers
        .get(&task_id)
        .map(|e| e.clone())
        .unwrap_or_else(|| {
            let handle = factory.create(&task);
            engineers.insert(task_id, handle.clone());
            handle
        });

    // Step 4: run the development agent inside the task's worktree.
    info!(%task_id, engineer_id = %engineer.id, path = %binding.worktree_path.display(), "dispatching development agent");
    let abort = AbortSignal::new();
    let outcome: Result<kugutsu_types::DevelopmentResult, String> = engineer
        .agent
        .run(&task, &binding.worktree_path, &abort)
        .await
        .map_err(|e| e.to_string())
        .and_then(|result| {
            if result.success {
                Ok(result)
            } else {
                Err(result.error.clone().unwrap_or_else(|| "development agent reported failure".to_string()))
            }
        });

    match outcome {
        Ok(result) => {
            if let Err(e) = dep_manager.mark_developed(task_id) {
                warn!(%task_id, error = %e, "failed to mark task developed");
            }
            bus.publish(PipelineEvent::DevelopmentCompleted { task, result, engineer_id: engineer.id });
            Outcome::Completed
        }
        Err(reason) => {
            if retry_count + 1 < max_dev_retries {
                warn!(%task_id, retry_count, %reason, "development attempt failed, retrying");
                Outcome::Requeue { item: DevelopmentItem { task, retry_count: retry_count + 1 }, priority: 0 }
            } else {
                warn!(%task_id, %reason, "development attempt exhausted retries");
                fail_task(task, dep_manager, worktrees, engineers, bus, FailurePhase::Development, reason)
            }
        }
    }
}

fn fail_task(
    task: Task,
    dep_manager: &DependencyManager,
    worktrees: &WorktreeManager,
    engineers: &DashMap<TaskId, EngineerHandle>,
    bus: &EventBus,
    phase: FailurePhase,
    reason: String,
) -> Outcome<DevelopmentItem> {
    let task_id = task.id;
    engineers.remove(&task_id);

    if !task.is_conflict_resolution() {
        if let Err(e) = worktrees.remove_worktree(task_id) {
            warn!(%task_id, error = %e, "failed to remove worktree after task failure");
        }
    }

    let cascaded = dep_manager.mark_failed(task_id).unwrap_or_default();
    bus.publish(PipelineEvent::TaskFailed { task_id, phase, reason: reason.clone() });
    for dependent_id in cascaded {
        bus.publish(PipelineEvent::TaskFailed {
            task_id: dependent_id,
            phase: FailurePhase::Cascade,
            reason: format!("upstream dependency {task_id} failed: {reason}"),
        });
    }
    Outcome::Failed
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use kugutsu_agents::AgentError;
    use kugutsu_types::{DevelopmentResult, Priority, TaskKind};
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;

    struct AlwaysSucceeds;

    #[async_trait]
    impl DevelopmentAgent for AlwaysSucceeds {
        async fn run(&self, _task: &Task, _workdir: &std::path::Path, _abort: &AbortSignal) -> Result<DevelopmentResult, AgentError> {
            Ok(DevelopmentResult { success: true, files_changed: vec![], output: "ok".to_string(), error: None })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl DevelopmentAgent for AlwaysFails {
        async fn run(&self, _task: &Task, _workdir: &std::path::Path, _abort: &AbortSignal) -> Result<DevelopmentResult, AgentError> {
            Err(AgentError::DevelopmentFailed("boom".to_string()))
        }
    }

    struct StaticFactory(Arc<dyn DevelopmentAgent>);

    impl EngineerFactory for StaticFactory {
        fn create(&self, _task: &Task) -> EngineerHandle {
            EngineerHandle::new("engineer-1".to_string(), self.0.clone())
        }
    }

    fn init_repo(dir: &std::path::Path) {
        for args in [vec!["init", "-b", "main"], vec!["config", "user.email", "t@t.com"], vec!["config", "user.name", "T"]] {
            Command::new("git").args(args).current_dir(dir).output().unwrap();
        }
        std::fs::write(dir.join("README.md"), "hi\n").unwrap();
        Command::new("git").args(["add", "-A"]).current_dir(dir).output().unwrap();
        Command::new("git").args(["commit", "-m", "initial"]).current_dir(dir).output().unwrap();
    }

    #[tokio::test]
    async fn ready_task_publishes_development_completed() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path());
        let wt_base = TempDir::new().unwrap();

        let dep_manager = Arc::new(DependencyManager::new());
        let task_id = Uuid::new_v4();
        let task = Task::new(task_id, "t", "d", TaskKind::Feature, Priority::High, vec![]);
        dep_manager.build_dependency_graph(vec![task.clone()]).unwrap();

        let worktrees = Arc::new(WorktreeManager::new(repo_dir.path().to_path_buf(), wt_base.path().to_path_buf(), "main".to_string()));
        let factory: Arc<dyn EngineerFactory> = Arc::new(StaticFactory(Arc::new(AlwaysSucceeds)));
        let engineers = Arc::new(DashMap::new());
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let _reg = bus.subscribe(move |env| {
            if matches!(env.event, PipelineEvent::DevelopmentCompleted { .. }) {
                s.fetch_add(1, Ordering::SeqCst);
            }
        });

        let queue = DevelopmentQueue::new(dep_manager, worktrees, factory, engineers, bus, 2, 3);
        queue.start();
        queue.enqueue(task, Priority::High.weight());
        queue.wait_for_completion().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_cascade_fail_dependents() {
        let repo_dir = TempDir::new().unwrap();
        init_repo(repo_dir.path());
        let wt_base = TempDir::new().unwrap();

        let dep_manager = Arc::new(DependencyManager::new());
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let a = Task::new(a_id, "a", "d", TaskKind::Feature, Priority::High, vec![]);
        let b = Task::new(b_id, "b", "d", TaskKind::Feature, Priority::Medium, vec![a_id]);
        dep_manager.build_dependency_graph(vec![a.clone(), b]).unwrap();

        let worktrees = Arc::new(WorktreeManager::new(repo_dir.path().to_path_buf(), wt_base.path().to_path_buf(), "main".to_string()));
        let factory: Arc<dyn EngineerFactory> = Arc::new(StaticFactory(Arc::new(AlwaysFails)));
        let engineers = Arc::new(DashMap::new());
        let bus = EventBus::new();
        let cascaded = Arc::new(AtomicUsize::new(0));
        let c = cascaded.clone();
        let _reg = bus.subscribe(move |env| {
            if let PipelineEvent::TaskFailed { phase: FailurePhase::Cascade, .. } = &env.event {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        let queue = DevelopmentQueue::new(dep_manager.clone(), worktrees, factory, engineers, bus, 2, 1);
        queue.start();
        queue.enqueue(a, Priority::High.weight());
        queue.wait_for_completion().await;

        assert_eq!(cascaded.load(Ordering::SeqCst), 1);
        assert_eq!(dep_manager.state_of(b_id), Some(kugutsu_types::TaskState::Failed));
    }
}
