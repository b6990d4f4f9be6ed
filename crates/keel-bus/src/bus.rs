//! Synchronous publish/subscribe with a per-listener error boundary.

use crate::listener::EventListener;
use crate::metrics::{BusMetrics, LatencyTimer};
use keel_core::ListenerId;
use keel_core::events::{Event, EventKind, EventPayload, ListenerFailure};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

struct Registration {
    id: ListenerId,
    /// Empty means every kind.
    kinds: Vec<EventKind>,
    listener: Arc<dyn EventListener>,
}

impl Registration {
    fn accepts(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// In-process event bus.
///
/// Cloning is cheap and clones share listeners and metrics.
#[derive(Clone, Default)]
pub struct EventBus {
    registrations: Arc<RwLock<Vec<Registration>>>,
    metrics: Arc<BusMetrics>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for the given kinds. Listeners are invoked in
    /// registration order.
    pub fn subscribe(&self, kinds: &[EventKind], listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId::new();
        debug!(listener = %listener.name(), ?kinds, "Subscribing listener");
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                kinds: kinds.to_vec(),
                listener,
            });
        id
    }

    /// Register `listener` for every event.
    pub fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.subscribe(&[], listener)
    }

    /// Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn metrics(&self) -> Arc<BusMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Deliver `event` to every listener registered for its kind and return
    /// it with any listener failures attached.
    ///
    /// The listener set is snapshotted before dispatch: subscriptions made
    /// while the event is being delivered (including from listeners) only
    /// affect later publishes. Never fails.
    pub fn publish(&self, mut event: Event) -> Event {
        let timer = LatencyTimer::start();
        let kind = event.kind();

        let snapshot: Vec<Arc<dyn EventListener>> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.accepts(kind))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in &snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.handle_event(&event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    self.metrics.record_error();
                    err.to_string()
                }
                Err(panic) => {
                    self.metrics.record_panic();
                    format!("listener panicked: {}", panic_message(panic.as_ref()))
                }
            };

            let name = listener.name();
            error!(listener = %name, event = %event, error = %message, "Event listener failed");
            event.add_exception(ListenerFailure {
                listener: name,
                message,
            });
        }

        self.metrics
            .record_publish(snapshot.len() as u64, timer.elapsed_micros());
        event
    }

    /// Build and publish an event in one call.
    pub fn publish_payload(&self, source: &str, payload: EventPayload) -> Event {
        self.publish(Event::new(source, payload))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FnListener;
    use keel_core::{Error, ProjectId};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn removed(name: &str) -> Event {
        Event::new(
            "test",
            EventPayload::ProjectRemoved {
                project: ProjectId::new(name),
            },
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Arc<dyn EventListener> {
        let log = Arc::clone(log);
        Arc::new(FnListener::new(name, move |_e: &Event| {
            log.lock().unwrap().push(name.to_string());
            Ok(())
        }))
    }

    #[test]
    fn test_delivers_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(recorder(&log, "first"));
        bus.subscribe(&[EventKind::ProjectRemoved], recorder(&log, "second"));
        bus.subscribe(&[EventKind::BuildCompleted], recorder(&log, "ignored"));
        bus.subscribe_all(recorder(&log, "third"));

        let event = bus.publish(removed("demo"));

        assert!(!event.has_exceptions());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_listeners_do_not_stop_dispatch() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(recorder(&log, "a"));
        bus.subscribe_all(Arc::new(FnListener::new("erroring", |_e: &Event| {
            Err(Error::Listener("nope".to_string()))
        })));
        bus.subscribe_all(recorder(&log, "b"));
        bus.subscribe_all(Arc::new(FnListener::new("panicking", |_e: &Event| {
            panic!("kaboom")
        })));
        bus.subscribe_all(recorder(&log, "c"));

        let event = bus.publish(removed("demo"));

        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        let failed: Vec<_> = event.exceptions().iter().map(|f| f.listener.as_str()).collect();
        assert_eq!(failed, vec!["erroring", "panicking"]);
        assert!(event.exceptions()[1].message.contains("kaboom"));

        let snapshot = bus.metrics().snapshot();
        assert_eq!(snapshot.events_published, 1);
        assert_eq!(snapshot.deliveries, 5);
        assert_eq!(snapshot.listener_failures(), 2);
    }

    #[test]
    fn test_subscription_during_dispatch_affects_next_publish_only() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = bus.clone();
        let inner_log = Arc::clone(&log);
        bus.subscribe_all(Arc::new(FnListener::new("subscriber", move |_e: &Event| {
            inner_bus.subscribe_all(recorder(&inner_log, "late"));
            Ok(())
        })));

        bus.publish(removed("one"));
        assert!(log.lock().unwrap().is_empty());

        bus.publish(removed("two"));
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe_all(recorder(&log, "gone"));
        assert_eq!(bus.listener_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(removed("demo"));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_nested_publish_from_listener() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_bus = bus.clone();
        bus.subscribe(
            &[EventKind::ProjectRemoved],
            Arc::new(FnListener::new("forwarder", move |_e: &Event| {
                inner_bus.publish_payload(
                    "forwarder",
                    EventPayload::ScmPollFailed {
                        project: ProjectId::new("demo"),
                        error: "gone".to_string(),
                    },
                );
                Ok(())
            })),
        );
        bus.subscribe(&[EventKind::ScmPollFailed], recorder(&log, "poll"));

        bus.publish(removed("demo"));
        assert_eq!(*log.lock().unwrap(), vec!["poll"]);
    }
}
