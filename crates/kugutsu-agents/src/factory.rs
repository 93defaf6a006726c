use kugutsu_types::Task;

use crate::agent::EngineerHandle;

/// Creates a fresh [`EngineerHandle`] for a task's first dispatch. The
/// development queue holds on to the handle and reuses it for every
/// subsequent revision round of the same task.
pub trait EngineerFactory: Send + Sync {
    fn create(&self, task: &Task) -> EngineerHandle;
}
