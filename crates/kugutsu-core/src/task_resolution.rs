//! Resolves the planning agent's raw task list into the graph-ready [`Task`]
//! type: dependency references may be either a task id or another task's
//! title, and the dependency manager only understands ids.

use kugutsu_agents::{RawTask, TaskSourceOutput};
use kugutsu_types::{Task, TaskId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskResolutionError {
    #[error("task source produced no tasks")]
    Empty,
    #[error("task {task} depends on unknown reference {reference:?}")]
    UnknownDependency { task: TaskId, reference: String },
}

/// Resolves every [`RawTask`]'s dependency references to ids, preferring an
/// exact id parse and falling back to a title match among the same batch.
pub fn resolve_tasks(output: &TaskSourceOutput) -> Result<Vec<Task>, TaskResolutionError> {
    if output.tasks.is_empty() {
        return Err(TaskResolutionError::Empty);
    }

    let by_title: std::collections::HashMap<&str, TaskId> =
        output.tasks.iter().map(|t| (t.title.as_str(), t.id)).collect();

    output
        .tasks
        .iter()
        .map(|raw: &RawTask| {
            let dependencies = raw
                .dependencies
                .iter()
                .map(|reference| {
                    if let Ok(id) = reference.parse::<TaskId>() {
                        return Ok(id);
                    }
                    by_title.get(reference.as_str()).copied().ok_or_else(|| {
                        TaskResolutionError::UnknownDependency {
                            task: raw.id,
                            reference: reference.clone(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Task::new(raw.id, raw.title.clone(), raw.description.clone(), raw.kind, raw.priority, dependencies))
        })
        .collect()
}
