//! Typed publish/subscribe bus for [`PipelineEvent`]s.
//!
//! Delivery is synchronous within a single [`EventBus::publish`] call,
//! ordered by subscription time. A handler that returns an error is logged
//! and does not prevent delivery to the remaining subscribers; neither does
//! one that panics.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use kugutsu_types::{EventEnvelope, PipelineEvent};
use parking_lot::RwLock;
use tracing::{debug, warn};

pub type Handler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// A registration returned by [`EventBus::subscribe`]/[`EventBus::on_any`].
/// Dropping it does not unsubscribe; call [`Registration::unregister`]
/// explicitly, which is idempotent.
#[derive(Clone)]
pub struct Registration {
    id: u64,
    bus: Arc<Inner>,
    any: bool,
}

impl Registration {
    pub fn unregister(&self) {
        let mut slot = if self.any {
            self.bus.any_subscribers.write()
        } else {
            self.bus.subscribers.write()
        };
        slot.retain(|(id, _)| *id != self.id);
    }
}

struct Inner {
    subscribers: RwLock<Vec<(u64, Handler)>>,
    any_subscribers: RwLock<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

/// One bus per [`crate::coordinator::PipelineCoordinator`]; never a
/// process-wide singleton, so tests can run independent pipelines in the
/// same process without cross-talk.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(Vec::new()),
                any_subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribes to every event kind. Filtering by kind is the handler's
    /// job (via [`PipelineEvent::kind_name`] or matching on the variant).
    pub fn subscribe<F>(&self, handler: F) -> Registration
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.write().push((id, Arc::new(handler)));
        Registration {
            id,
            bus: self.inner.clone(),
            any: false,
        }
    }

    /// Diagnostics-only hook that also sees every event, kept in a separate
    /// list so `subscribe` handlers and `on_any` handlers can be unregistered
    /// independently.
    pub fn on_any<F>(&self, handler: F) -> Registration
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.any_subscribers.write().push((id, Arc::new(handler)));
        Registration {
            id,
            bus: self.inner.clone(),
            any: true,
        }
    }

    /// Fans the event out to every subscriber, in subscription order, then
    /// to every `on_any` handler. Each call is isolated with
    /// `catch_unwind`: a panicking handler is logged and does not prevent
    /// delivery to the remaining subscribers.
    pub fn publish(&self, event: PipelineEvent) {
        let envelope = EventEnvelope { event, at: Utc::now() };
        debug!(kind = envelope.event.kind_name(), "publishing event");

        let subscribers = self.inner.subscribers.read().clone();
        for (id, handler) in subscribers.iter() {
            call_handler(*id, handler, &envelope);
        }

        let any_subscribers = self.inner.any_subscribers.read().clone();
        for (id, handler) in any_subscribers.iter() {
            call_handler(*id, handler, &envelope);
        }

        if subscribers.is_empty() && any_subscribers.is_empty() {
            warn!(kind = envelope.event.kind_name(), "event published with no subscribers");
        }
    }
}

fn call_handler(id: u64, handler: &Handler, envelope: &EventEnvelope) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(envelope)));
    if let Err(panic) = result {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(subscriber_id = id, kind = envelope.event.kind_name(), %message, "subscriber panicked, continuing delivery to remaining subscribers");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kugutsu_types::TaskId;

    use super::*;

    fn sample_event() -> PipelineEvent {
        PipelineEvent::AllTasksCompleted { total: 3 }
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o1 = order.clone();
        let _r1 = bus.subscribe(move |_| o1.lock().push(1));
        let o2 = order.clone();
        let _r2 = bus.subscribe(move |_| o2.lock().push(2));

        bus.publish(sample_event());
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn unregister_is_idempotent() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let reg = bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(sample_event());
        reg.unregister();
        reg.unregister();
        bus.publish(sample_event());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_failing_handler_does_not_block_the_next() {
        let bus = EventBus::new();
        let second_ran = Arc::new(AtomicUsize::new(0));

        let _r1 = bus.subscribe(|_| {
            // simulates a handler that only logs internally on error
        });
        let second = second_ran.clone();
        let _r2 = bus.subscribe(move |_| {
            second.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(sample_event());
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_handler_does_not_block_the_next() {
        let bus = EventBus::new();
        let second_ran = Arc::new(AtomicUsize::new(0));

        let _r1 = bus.subscribe(|_| panic!("boom"));
        let second = second_ran.clone();
        let _r2 = bus.subscribe(move |_| {
            second.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(sample_event());
        assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_any_sees_every_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let s = seen.clone();
        let _r = bus.on_any(move |env| s.lock().push(env.event.kind_name().to_string()));

        bus.publish(PipelineEvent::DependencyResolved {
            task_id: TaskId::nil(),
            newly_ready: vec![],
        });
        bus.publish(sample_event());

        assert_eq!(*seen.lock(), vec!["dependency-resolved", "all-tasks-completed"]);
    }
}
