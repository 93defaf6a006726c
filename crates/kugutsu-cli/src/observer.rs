//! Plain stdout progress transport: the one `PipelineObserver` the binary
//! ships, per the core's injected-observer pattern. Richer transports
//! (a TUI, a websocket log stream) are external collaborators.

use kugutsu_core::PipelineObserver;
use kugutsu_types::TaskId;

pub struct StdoutObserver;

impl PipelineObserver for StdoutObserver {
    fn on_log(&self, message: &str) {
        println!("[kugutsu] {message}");
    }

    fn on_task_status(&self, task_id: TaskId, status: &str) {
        println!("[kugutsu] task {task_id}: {status}");
    }

    fn on_engineer_count(&self, active: usize, max: usize) {
        println!("[kugutsu] progress: {active}/{max} tasks completed");
    }

    fn on_all_completed(&self, total: usize) {
        println!("[kugutsu] all {total} tasks completed");
    }
}
