//! Dispatches a review agent per completed development (pipeline component
//! C6). Concurrency-capped at `maxEngineers`, same bound as the Development
//! Queue since both compete for the same pool of agent invocations.

use std::sync::Arc;

use dashmap::DashMap;
use kugutsu_agents::{AbortSignal, ReviewAgent};
use kugutsu_types::{DevelopmentResult, PipelineEvent, ReviewVerdict, Task, TaskId};
use tracing::warn;

use crate::event_bus::EventBus;
use crate::task_queue::{Outcome, QueueItem, TaskQueue};

#[derive(Clone)]
pub struct ReviewItem {
    pub task: Task,
    pub result: DevelopmentResult,
    pub engineer_id: String,
}

impl QueueItem for ReviewItem {
    fn id(&self) -> TaskId {
        self.task.id
    }
}

/// Review round counter and accumulated verdict history, both keyed by the
/// task's own id: a revision variant reuses its original task's id, so the
/// counter naturally tracks "how many times has this task's work been
/// reviewed" across revision rounds without any extra bookkeeping.
pub struct ReviewQueue {
    queue: TaskQueue<ReviewItem>,
    reviewer: Arc<dyn ReviewAgent>,
    history: Arc<DashMap<TaskId, Vec<ReviewVerdict>>>,
    rounds: Arc<DashMap<TaskId, u32>>,
    bus: EventBus,
}

impl ReviewQueue {
    pub fn new(reviewer: Arc<dyn ReviewAgent>, bus: EventBus, max_concurrent: usize) -> Self {
        Self {
            queue: TaskQueue::new("review", max_concurrent),
            reviewer,
            history: Arc::new(DashMap::new()),
            rounds: Arc::new(DashMap::new()),
            bus,
        }
    }

    pub fn enqueue(&self, item: ReviewItem) {
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

    /// How many times this task's work has been reviewed so far, counting
    /// only needs-revision verdicts.
    pub fn round_count(&self, task_id: TaskId) -> u32 {
        self.rounds.get(&task_id).map(|r| *r).unwrap_or(0)
    }

    pub fn history_for(&self, task_id: TaskId) -> Vec<ReviewVerdict> {
        self.history.get(&task_id).map(|h| h.clone()).unwrap_or_default()
    }

    pub fn start(&self) {
        let reviewer = self.reviewer.clone();
        let history = self.history.clone();
        let rounds = self.rounds.clone();
        let bus = self.bus.clone();

        self.queue.start(Arc::new(move |item: ReviewItem| {
            let reviewer = reviewer.clone();
            let history = history.clone();
            let rounds = rounds.clone();
            let bus = bus.clone();
            Box::pin(async move {
                let task_id = item.task.id;
                let abort = AbortSignal::new();
                match reviewer.review(&item.task, &item.result, &abort).await {
                    Ok(verdict) => {
                        history.entry(task_id).or_default().push(verdict.clone());

                        if verdict.approved {
                            bus.publish(PipelineEvent::ReviewCompleted {
                                task_id,
                                needs_revision: false,
                                verdict: verdict.clone(),
                            });
                            bus.publish(PipelineEvent::MergeReady {
                                task: item.task,
                                result: item.result,
                                review_history: history.get(&task_id).map(|h| h.clone()).unwrap_or_default(),
                                engineer_id: item.engineer_id,
                            });
                        } else {
                            *rounds.entry(task_id).or_insert(0) += 1;
                            bus.publish(PipelineEvent::ReviewCompleted {
                                task_id,
                                needs_revision: true,
                                verdict,
                            });
                        }
                        Outcome::Completed
                    }
                    Err(e) => {
                        warn!(%task_id, error = %e, "review agent call failed");
                        bus.publish(PipelineEvent::TaskFailed {
                            task_id,
                            phase: kugutsu_types::FailurePhase::Review,
                            reason: e.to_string(),
                        });
                        Outcome::Failed
                    }
                }
            })
        }));
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use kugutsu_agents::AgentError;
    use kugutsu_types::{Priority, TaskKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    use super::*;

    struct ScriptedReviewer {
        verdicts: std::sync::Mutex<Vec<ReviewVerdict>>,
    }

    #[async_trait]
    impl ReviewAgent for ScriptedReviewer {
        async fn review(&self, _task: &Task, _result: &DevelopmentResult, _abort: &AbortSignal) -> Result<ReviewVerdict, AgentError> {
            Ok(self.verdicts.lock().unwrap().remove(0))
        }
    }

    fn dev_result() -> DevelopmentResult {
        DevelopmentResult { success: true, files_changed: vec![], output: String::new(), error: None }
    }

    #[tokio::test]
    async fn approval_publishes_merge_ready() {
        let reviewer = Arc::new(ScriptedReviewer {
            verdicts: std::sync::Mutex::new(vec![ReviewVerdict { approved: true, comments: vec![] }]),
        });
        let bus = EventBus::new();
        let merge_ready_seen = Arc::new(AtomicUsize::new(0));
        let seen = merge_ready_seen.clone();
        let _reg = bus.subscribe(move |env| {
            if matches!(env.event, PipelineEvent::MergeReady { .. }) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let queue = ReviewQueue::new(reviewer, bus, 2);
        queue.start();
        let task = Task::new(Uuid::new_v4(), "t", "d", TaskKind::Feature, Priority::Medium, vec![]);
        queue.enqueue(ReviewItem { task, result: dev_result(), engineer_id: "e1".to_string() });
        queue.wait_for_completion().await;

        assert_eq!(merge_ready_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn needs_revision_increments_round_counter() {
        let reviewer = Arc::new(ScriptedReviewer {
            verdicts: std::sync::Mutex::new(vec![ReviewVerdict {
                approved: false,
                comments: vec!["add tests".to_string()],
            }]),
        });
        let bus = EventBus::new();
        let queue = ReviewQueue::new(reviewer, bus, 2);
        queue.start();
        let task_id = Uuid::new_v4();
        let task = Task::new(task_id, "t", "d", TaskKind::Feature, Priority::Medium, vec![]);
        queue.enqueue(ReviewItem { task, result: dev_result(), engineer_id: "e1".to_string() });
        queue.wait_for_completion().await;

        assert_eq!(queue.round_count(task_id), 1);
        assert_eq!(queue.history_for(task_id).len(), 1);
    }
}
