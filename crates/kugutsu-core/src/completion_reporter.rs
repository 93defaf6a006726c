//! Tracks per-task completion against a known total and emits
//! `task-completed`/`all-tasks-completed` (pipeline component C9).
//!
//! Keyed by task id rather than title (see the Open Question resolution in
//! the project's design ledger): titles are a display concern only, and a
//! conflict-resolution or revision task carries the same id as the original
//! it replaces, so completion bookkeeping never has to special-case them.

use dashmap::DashMap;
use kugutsu_types::{PipelineEvent, TaskId};

use crate::event_bus::EventBus;

pub struct CompletionReporter {
    titles: DashMap<TaskId, String>,
    completed: DashMap<TaskId, ()>,
    total: usize,
    bus: EventBus,
}

impl CompletionReporter {
    pub fn new(tasks: &[(TaskId, String)], bus: EventBus) -> Self {
        let titles = DashMap::new();
        for (id, title) in tasks {
            titles.insert(*id, title.clone());
        }
        Self {
            total: titles.len(),
            titles,
            completed: DashMap::new(),
            bus,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Marks `task_id` completed using `display_title` for the event
    /// payload. Idempotent: a second call for the same id is a no-op and
    /// publishes nothing.
    pub fn mark_task_completed(&self, task_id: TaskId, display_title: &str) {
        if self.completed.insert(task_id, ()).is_some() {
            return;
        }

        let completed = self.completed.len();
        let total = self.total.max(completed);
        let percentage = if total == 0 { 100.0 } else { (completed as f64 / total as f64) * 100.0 };

        self.bus.publish(PipelineEvent::TaskCompleted {
            task_id,
            title: display_title.to_string(),
            completed,
            total,
            percentage,
        });

        if completed == total {
            self.bus.publish(PipelineEvent::AllTasksCompleted { total });
        }
    }

    pub fn title_of(&self, task_id: TaskId) -> Option<String> {
        self.titles.get(&task_id).map(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;

    #[test]
    fn mark_completed_is_idempotent_on_the_counter() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let reporter = CompletionReporter::new(&[(id, "task".to_string())], bus);

        reporter.mark_task_completed(id, "task");
        reporter.mark_task_completed(id, "task");

        assert_eq!(reporter.completed_count(), 1);
    }

    #[test]
    fn all_tasks_completed_fires_exactly_once() {
        let bus = EventBus::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let reporter = CompletionReporter::new(
            &[(a, "a".to_string()), (b, "b".to_string())],
            bus.clone(),
        );

        let all_done_count = Arc::new(AtomicUsize::new(0));
        let counter = all_done_count.clone();
        let _reg = bus.subscribe(move |env| {
            if matches!(env.event, PipelineEvent::AllTasksCompleted { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        reporter.mark_task_completed(a, "a");
        assert_eq!(all_done_count.load(Ordering::SeqCst), 0);
        reporter.mark_task_completed(b, "b");
        assert_eq!(all_done_count.load(Ordering::SeqCst), 1);
    }
}
