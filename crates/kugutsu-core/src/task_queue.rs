//! A bounded-concurrency, priority-ordered work queue parameterized by a
//! processor callback (pipeline component C2). Used for both the
//! Development Queue and the Review Queue; the Merge Coordinator builds on
//! top of it with `max_concurrent = 1`.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomOrdering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kugutsu_types::TaskId;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Anything schedulable by a [`TaskQueue`] must expose the task id its
/// identity and duplicate-rejection is keyed on.
pub trait QueueItem: Send + 'static {
    fn id(&self) -> TaskId;
}

/// What a processor callback decides to do with the item it was handed.
/// `Requeue` lets a processor put itself back on the queue (e.g. "still
/// blocked on a dependency, try again later") without racing the queue's
/// duplicate-enqueue check: the item is re-submitted only after this worker
/// has cleared it from the processing set.
pub enum Outcome<T> {
    Completed,
    Failed,
    Requeue { item: T, priority: i32 },
}

pub type Processor<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Outcome<T>> + Send + Sync>;

pub struct TaskQueueStats {
    pub waiting: usize,
    pub processing: usize,
    pub max_concurrent: usize,
}

struct Entry<T> {
    item: T,
    priority: i32,
    seq: u64,
}

struct State<T> {
    waiting: Vec<Entry<T>>,
    processing: HashSet<TaskId>,
    accepting: bool,
}

impl<T> State<T> {
    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.processing.is_empty()
    }
}

struct Shared<T> {
    name: &'static str,
    max_concurrent: usize,
    state: Mutex<State<T>>,
    work_available: Notify,
    idle_tx: watch::Sender<bool>,
    next_seq: AtomicU64,
}

impl<T: QueueItem> Shared<T> {
    fn enqueue(&self, item: T, priority: i32) {
        let id = item.id();
        let mut state = self.state.lock();
        if !state.accepting {
            tracing::warn!(queue = self.name, %id, "enqueue rejected: queue is stopped");
            return;
        }
        if state.processing.contains(&id) || state.waiting.iter().any(|e| e.item.id() == id) {
            tracing::warn!(queue = self.name, %id, "duplicate enqueue ignored");
            return;
        }
        let seq = self.next_seq.fetch_add(1, AtomOrdering::SeqCst);
        let pos = state
            .waiting
            .partition_point(|e| e.priority > priority || (e.priority == priority && e.seq < seq));
        state.waiting.insert(pos, Entry { item, priority, seq });
        debug!(queue = self.name, %id, priority, "ITEM_ADDED");
        let _ = self.idle_tx.send(false);
        drop(state);
        self.work_available.notify_one();
    }
}

/// A bounded-concurrency, priority-ordered work queue. `start` must be
/// called exactly once; subsequent calls are no-ops.
pub struct TaskQueue<T: QueueItem> {
    shared: Arc<Shared<T>>,
    idle_rx: watch::Receiver<bool>,
    started: AtomicBool,
}

impl<T: QueueItem> TaskQueue<T> {
    pub fn new(name: &'static str, max_concurrent: usize) -> Self {
        let (idle_tx, idle_rx) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                name,
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(State {
                    waiting: Vec::new(),
                    processing: HashSet::new(),
                    accepting: true,
                }),
                work_available: Notify::new(),
                idle_tx,
                next_seq: AtomicU64::new(0),
            }),
            idle_rx,
            started: AtomicBool::new(false),
        }
    }

    /// Inserts preserving descending-priority order among waiting items
    /// (ties broken FIFO). A duplicate id already waiting or processing is
    /// a silent no-op.
    pub fn enqueue(&self, item: T, priority: i32) {
        self.shared.enqueue(item, priority);
    }

    /// Launches up to `max_concurrent` cooperative workers. Each worker pulls
    /// the highest-priority waiting item, runs `processor`, and loops until
    /// `stop()` has been called and no waiting work remains.
    pub fn start(&self, processor: Processor<T>) {
        if self.started.swap(true, AtomOrdering::SeqCst) {
            return;
        }
        for _ in 0..self.shared.max_concurrent {
            let shared = self.shared.clone();
            let processor = processor.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut s = shared.state.lock();
                        if let Some(pos) = (!s.waiting.is_empty()).then_some(0) {
                            let entry = s.waiting.remove(pos);
                            s.processing.insert(entry.item.id());
                            Some(entry.item)
                        } else {
                            None
                        }
                    };

                    let item = match item {
                        Some(item) => item,
                        None => {
                            let stopped = {
                                let s = shared.state.lock();
                                !s.accepting && s.waiting.is_empty()
                            };
                            if stopped {
                                return;
                            }
                            shared.work_available.notified().await;
                            continue;
                        }
                    };

                    let id = item.id();
                    debug!(queue = shared.name, %id, "ITEM_PROCESSING");
                    // A panicking processor (e.g. an external agent call that
                    // unwraps a subprocess result) must not unwind this
                    // worker: the item is already in `processing`, and an
                    // unwind here would leak it there forever, stalling
                    // `wait_for_completion`. Caught and converted to Failed.
                    let outcome = match AssertUnwindSafe(processor(item)).catch_unwind().await {
                        Ok(outcome) => outcome,
                        Err(panic) => {
                            let message = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "non-string panic payload".to_string());
                            warn!(queue = shared.name, %id, %message, "processor panicked, treating item as failed");
                            Outcome::Failed
                        }
                    };

                    {
                        let mut s = shared.state.lock();
                        s.processing.remove(&id);
                    }

                    match outcome {
                        Outcome::Completed => debug!(queue = shared.name, %id, "ITEM_COMPLETED"),
                        Outcome::Failed => debug!(queue = shared.name, %id, "ITEM_FAILED"),
                        Outcome::Requeue { item, priority } => {
                            debug!(queue = shared.name, %id, priority, "item requeued by its own processor");
                            shared.enqueue(item, priority);
                        }
                    }

                    let now_idle = {
                        let s = shared.state.lock();
                        s.is_idle()
                    };
                    if now_idle {
                        let _ = shared.idle_tx.send(true);
                    }
                }
            });
        }
    }

    /// Stops accepting new work; in-flight and already-waiting items are
    /// allowed to finish.
    pub fn stop(&self) {
        self.shared.state.lock().accepting = false;
        self.shared.work_available.notify_waiters();
    }

    /// Returns once `waiting == 0 && processing == 0`.
    pub async fn wait_for_completion(&self) {
        let mut rx = self.idle_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn stats(&self) -> TaskQueueStats {
        let s = self.shared.state.lock();
        TaskQueueStats {
            waiting: s.waiting.len(),
            processing: s.processing.len(),
            max_concurrent: self.shared.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;

    #[derive(Clone)]
    struct Item {
        id: TaskId,
        label: &'static str,
    }

    impl QueueItem for Item {
        fn id(&self) -> TaskId {
            self.id
        }
    }

    #[tokio::test]
    async fn dequeue_respects_priority_then_insertion_order() {
        let queue: TaskQueue<Item> = TaskQueue::new("test", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.enqueue(Item { id: Uuid::new_v4(), label: "low" }, -50);
        queue.enqueue(Item { id: Uuid::new_v4(), label: "high-1" }, 50);
        queue.enqueue(Item { id: Uuid::new_v4(), label: "high-2" }, 50);
        queue.enqueue(Item { id: Uuid::new_v4(), label: "medium" }, 0);

        let o = order.clone();
        queue.start(Arc::new(move |item: Item| {
            let o = o.clone();
            Box::pin(async move {
                o.lock().push(item.label);
                Outcome::Completed
            })
        }));
        queue.wait_for_completion().await;

        assert_eq!(*order.lock(), vec!["high-1", "high-2", "medium", "low"]);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_idempotent() {
        let queue: TaskQueue<Item> = TaskQueue::new("test", 2);
        let id = Uuid::new_v4();
        let runs = Arc::new(AtomicUsize::new(0));

        queue.enqueue(Item { id, label: "a" }, 0);
        queue.enqueue(Item { id, label: "a-dup" }, 50);

        let r = runs.clone();
        queue.start(Arc::new(move |_item: Item| {
            let r = r.clone();
            Box::pin(async move {
                r.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Outcome::Completed
            })
        }));
        queue.wait_for_completion().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn requeue_from_inside_the_processor_does_not_deadlock() {
        let queue: TaskQueue<Item> = TaskQueue::new("test", 1);
        let id = Uuid::new_v4();
        let attempts = Arc::new(AtomicUsize::new(0));

        queue.enqueue(Item { id, label: "retry-me" }, 0);

        let a = attempts.clone();
        queue.start(Arc::new(move |item: Item| {
            let a = a.clone();
            Box::pin(async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Outcome::Requeue { item, priority: -100 }
                } else {
                    Outcome::Completed
                }
            })
        }));
        queue.wait_for_completion().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_panicking_processor_does_not_hang_wait_for_completion() {
        let queue: TaskQueue<Item> = TaskQueue::new("test", 1);
        let ran_after = Arc::new(AtomicUsize::new(0));

        queue.enqueue(Item { id: Uuid::new_v4(), label: "boom" }, 0);
        queue.enqueue(Item { id: Uuid::new_v4(), label: "after" }, 0);

        let r = ran_after.clone();
        queue.start(Arc::new(move |item: Item| {
            let r = r.clone();
            Box::pin(async move {
                if item.label == "boom" {
                    panic!("processor boom");
                }
                r.fetch_add(1, Ordering::SeqCst);
                Outcome::Completed
            })
        }));
        queue.wait_for_completion().await;

        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().processing, 0);
    }

    #[tokio::test]
    async fn stop_lets_in_flight_items_finish() {
        let queue: TaskQueue<Item> = TaskQueue::new("test", 1);
        let completed = Arc::new(AtomicUsize::new(0));

        queue.enqueue(Item { id: Uuid::new_v4(), label: "a" }, 0);

        let c = completed.clone();
        queue.start(Arc::new(move |_item: Item| {
            let c = c.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                c.fetch_add(1, Ordering::SeqCst);
                Outcome::Completed
            })
        }));
        queue.stop();
        queue.wait_for_completion().await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
