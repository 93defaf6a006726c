//! Task dependency graph and lifecycle state (pipeline component C3).
//!
//! The graph is built once from the initial task set and never gains or
//! loses nodes afterward; only per-task state transitions mutate it.

use std::collections::{HashMap, HashSet, VecDeque};

use dashmap::DashMap;
use kugutsu_types::{Task, TaskId, TaskState};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DependencyGraphError {
    #[error("task {0} depends on unknown task {1}")]
    UnknownDependency(TaskId, TaskId),
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error("dependency graph has cycles: {0:?}")]
    CyclesDetected(Vec<Vec<TaskId>>),
}

pub struct TaskDependencyStatus {
    /// Dependencies that are FAILED, blocking this task forever.
    pub blocked_by: Vec<TaskId>,
    /// Dependencies that are neither MERGED nor FAILED yet.
    pub waiting_for: Vec<TaskId>,
    pub ready_now: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatusSummary {
    pub waiting: usize,
    pub ready: usize,
    pub running: usize,
    pub developed: usize,
    pub merging: usize,
    pub merged: usize,
    pub failed: usize,
}

/// Holds the task graph and per-task lifecycle state. `mark_running` is
/// idempotent when the task is already `Running`; everywhere else a
/// transition simply overwrites the state, trusting the coordinator (the
/// only caller) to drive it correctly.
pub struct DependencyManager {
    tasks: DashMap<TaskId, Task>,
    states: DashMap<TaskId, TaskState>,
    /// Reverse edges: task id -> tasks that depend on it.
    dependents: DashMap<TaskId, Vec<TaskId>>,
    insertion_order: RwLock<Vec<TaskId>>,
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyManager {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            states: DashMap::new(),
            dependents: DashMap::new(),
            insertion_order: RwLock::new(Vec::new()),
        }
    }

    /// Sets every task to WAITING, validates dependency references, and
    /// rejects the whole batch if `detect_cycles` finds anything. Must be
    /// called exactly once, before any other method.
    pub fn build_dependency_graph(&self, tasks: Vec<Task>) -> Result<(), DependencyGraphError> {
        let known: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        for task in &tasks {
            for dep in &task.dependencies {
                if !known.contains(dep) {
                    return Err(DependencyGraphError::UnknownDependency(task.id, *dep));
                }
            }
        }

        let mut order = self.insertion_order.write();
        for task in tasks {
            order.push(task.id);
            for dep in &task.dependencies {
                self.dependents.entry(*dep).or_default().push(task.id);
            }
            self.states.insert(task.id, TaskState::Waiting);
            self.tasks.insert(task.id, task);
        }
        drop(order);

        let cycles = self.detect_cycles();
        if !cycles.is_empty() {
            return Err(DependencyGraphError::CyclesDetected(cycles));
        }
        Ok(())
    }

    /// Returns every simple cycle found via DFS over the dependency edges.
    /// A nonempty result is fatal: the coordinator aborts before `start`.
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<TaskId, Color> =
            self.tasks.iter().map(|e| (*e.key(), Color::White)).collect();
        let mut path: Vec<TaskId> = Vec::new();
        let mut cycles = Vec::new();

        fn visit(
            id: TaskId,
            tasks: &DashMap<TaskId, Task>,
            color: &mut HashMap<TaskId, Color>,
            path: &mut Vec<TaskId>,
            cycles: &mut Vec<Vec<TaskId>>,
        ) {
            color.insert(id, Color::Gray);
            path.push(id);

            if let Some(task) = tasks.get(&id) {
                for dep in task.dependencies.clone() {
                    match color.get(&dep).copied().unwrap_or(Color::Black) {
                        Color::White => visit(dep, tasks, color, path, cycles),
                        Color::Gray => {
                            let start = path.iter().position(|id| *id == dep).unwrap_or(0);
                            let mut cycle: Vec<TaskId> = path[start..].to_vec();
                            cycle.push(dep);
                            cycles.push(cycle);
                        }
                        Color::Black => {}
                    }
                }
            }

            path.pop();
            color.insert(id, Color::Black);
        }

        for id in self.insertion_order.read().iter().copied() {
            if color.get(&id).copied().unwrap_or(Color::Black) == Color::White {
                visit(id, &self.tasks, &mut color, &mut path, &mut cycles);
            }
        }
        cycles
    }

    /// WAITING tasks whose dependencies are all MERGED, in deterministic
    /// insertion order.
    pub fn get_ready_tasks(&self) -> Vec<Task> {
        self.insertion_order
            .read()
            .iter()
            .filter_map(|id| {
                let state = self.states.get(id).map(|s| *s)?;
                if state != TaskState::Waiting {
                    return None;
                }
                let task = self.tasks.get(id)?;
                let all_merged = task
                    .dependencies
                    .iter()
                    .all(|d| self.states.get(d).map(|s| *s == TaskState::Merged).unwrap_or(false));
                all_merged.then(|| task.clone())
            })
            .collect()
    }

    pub fn get_task_dependency_status(&self, id: TaskId) -> Result<TaskDependencyStatus, DependencyGraphError> {
        let task = self.tasks.get(&id).ok_or(DependencyGraphError::UnknownTask(id))?;
        let mut blocked_by = Vec::new();
        let mut waiting_for = Vec::new();
        for dep in &task.dependencies {
            match self.states.get(dep).map(|s| *s) {
                Some(TaskState::Merged) => {}
                Some(TaskState::Failed) => blocked_by.push(*dep),
                _ => waiting_for.push(*dep),
            }
        }
        let ready_now = blocked_by.is_empty() && waiting_for.is_empty();
        Ok(TaskDependencyStatus { blocked_by, waiting_for, ready_now })
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).map(|t| t.clone())
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.states.get(&id).map(|s| *s)
    }

    pub fn mark_running(&self, id: TaskId) -> Result<(), DependencyGraphError> {
        if self.state_of(id) == Some(TaskState::Running) {
            return Ok(());
        }
        self.set_state(id, TaskState::Running)
    }

    pub fn mark_developed(&self, id: TaskId) -> Result<(), DependencyGraphError> {
        self.set_state(id, TaskState::Developed)
    }

    pub fn mark_merging(&self, id: TaskId) -> Result<(), DependencyGraphError> {
        self.set_state(id, TaskState::Merging)
    }

    /// MERGING -> MERGED; returns the tasks newly promoted to READY (their
    /// state is also flipped from WAITING to READY here).
    pub fn mark_merged(&self, id: TaskId) -> Result<Vec<Task>, DependencyGraphError> {
        self.set_state(id, TaskState::Merged)?;

        let mut newly_ready = Vec::new();
        if let Some(dependents) = self.dependents.get(&id) {
            for dependent_id in dependents.value().clone() {
                if self.state_of(dependent_id) != Some(TaskState::Waiting) {
                    continue;
                }
                let task = match self.tasks.get(&dependent_id) {
                    Some(t) => t.clone(),
                    None => continue,
                };
                let all_merged = task
                    .dependencies
                    .iter()
                    .all(|d| self.states.get(d).map(|s| *s == TaskState::Merged).unwrap_or(false));
                if all_merged {
                    self.set_state(dependent_id, TaskState::Ready)?;
                    newly_ready.push(task);
                }
            }
        }
        Ok(newly_ready)
    }

    /// Marks `id` FAILED and cascades the failure breadth-first to every
    /// transitive dependent that is not already terminal. Returns the ids
    /// marked FAILED by the cascade (not including `id` itself).
    pub fn mark_failed(&self, id: TaskId) -> Result<Vec<TaskId>, DependencyGraphError> {
        self.set_state(id, TaskState::Failed)?;

        let mut cascaded = Vec::new();
        let mut queue: VecDeque<TaskId> = self
            .dependents
            .get(&id)
            .map(|d| d.value().clone())
            .unwrap_or_default()
            .into();
        let mut seen: HashSet<TaskId> = HashSet::new();

        while let Some(dep_id) = queue.pop_front() {
            if !seen.insert(dep_id) {
                continue;
            }
            if self.state_of(dep_id).map(|s| s.is_terminal()).unwrap_or(true) {
                continue;
            }
            self.set_state(dep_id, TaskState::Failed)?;
            cascaded.push(dep_id);
            if let Some(next) = self.dependents.get(&dep_id) {
                queue.extend(next.value().clone());
            }
        }
        Ok(cascaded)
    }

    /// (id, display title) for every task currently in the FAILED state, in
    /// insertion order, for the CLI's end-of-run summary.
    pub fn failed_tasks(&self) -> Vec<(TaskId, String)> {
        self.insertion_order
            .read()
            .iter()
            .filter(|id| self.states.get(id).map(|s| *s == TaskState::Failed).unwrap_or(false))
            .filter_map(|id| self.tasks.get(id).map(|t| (*id, t.display_title().to_string())))
            .collect()
    }

    pub fn get_status_summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        for entry in self.states.iter() {
            match *entry.value() {
                TaskState::Waiting => summary.waiting += 1,
                TaskState::Ready => summary.ready += 1,
                TaskState::Running => summary.running += 1,
                TaskState::Developed => summary.developed += 1,
                TaskState::Merging => summary.merging += 1,
                TaskState::Merged => summary.merged += 1,
                TaskState::Failed => summary.failed += 1,
            }
        }
        summary
    }

    fn set_state(&self, id: TaskId, state: TaskState) -> Result<(), DependencyGraphError> {
        if !self.tasks.contains_key(&id) {
            return Err(DependencyGraphError::UnknownTask(id));
        }
        debug!(%id, ?state, "task state transition");
        self.states.insert(id, state);
        Ok(())
    }
}
