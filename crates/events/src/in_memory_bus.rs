//! In-memory, type-routed event bus.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, error};

use crate::bus::EventBus;
use crate::runner::CursorTable;
use crate::{Event, EventEnvelope, Projection, ProjectionError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InMemoryBusError {
    /// The routing table lock was poisoned.
    #[error("event bus routing table poisoned")]
    Poisoned,

    /// A subscriber failed to fold the event.
    ///
    /// Remaining subscribers still receive the event; the first failure is
    /// reported.
    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

struct Subscriber<E: Event> {
    projection: Arc<dyn Projection<E>>,
    cursors: CursorTable,
}

/// Synchronous pub/sub bus with a registration table keyed by event type.
///
/// - No IO / no async: `publish` returns once every subscriber has handled
///   the event.
/// - Each subscriber keeps per-instance cursors, so redelivering an envelope
///   never reaches a handler twice.
pub struct InMemoryEventBus<E: Event> {
    routes: RwLock<HashMap<&'static str, Vec<Arc<Subscriber<E>>>>>,
}

impl<E: Event> InMemoryEventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a projection for every event type it declares.
    pub fn subscribe(&self, projection: Arc<dyn Projection<E>>) -> Result<(), InMemoryBusError> {
        let subscriber = Arc::new(Subscriber {
            cursors: CursorTable::new(projection.name()),
            projection,
        });

        let mut routes = self
            .routes
            .write()
            .map_err(|_| InMemoryBusError::Poisoned)?;
        for event_type in subscriber.projection.subscribed_to() {
            routes
                .entry(*event_type)
                .or_default()
                .push(Arc::clone(&subscriber));
        }
        debug!(
            projection = subscriber.projection.name(),
            event_types = ?subscriber.projection.subscribed_to(),
            "projection subscribed"
        );
        Ok(())
    }

    /// Number of subscribers registered for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.routes
            .read()
            .map(|routes| routes.get(event_type).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl<E: Event> Default for InMemoryEventBus<E> {
    fn default() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }
}

impl<E: Event> core::fmt::Debug for InMemoryEventBus<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let routes: Vec<(&'static str, Vec<&'static str>)> = match self.routes.read() {
            Ok(routes) => routes
                .iter()
                .map(|(ty, subs)| (*ty, subs.iter().map(|s| s.projection.name()).collect()))
                .collect(),
            Err(_) => Vec::new(),
        };
        f.debug_struct("InMemoryEventBus")
            .field("routes", &routes)
            .finish()
    }
}

impl<E: Event> EventBus<EventEnvelope<E>> for InMemoryEventBus<E> {
    type Error = InMemoryBusError;

    fn publish(&self, envelope: &EventEnvelope<E>) -> Result<(), Self::Error> {
        let event_type = envelope.event_type();

        // Snapshot the route so handlers run without the table lock held.
        let subscribers = {
            let routes = self.routes.read().map_err(|_| InMemoryBusError::Poisoned)?;
            routes.get(event_type).cloned().unwrap_or_default()
        };

        let mut first_failure = None;
        for sub in subscribers {
            let name = sub.projection.name();
            match sub.cursors.deliver(sub.projection.as_ref(), envelope) {
                Ok(true) => {}
                Ok(false) => debug!(
                    projection = name,
                    event_type,
                    aggregate_id = %envelope.aggregate_id(),
                    sequence_number = envelope.sequence_number(),
                    "duplicate delivery skipped"
                ),
                Err(err) => {
                    error!(projection = name, event_type, error = %err, "projection failed to handle event");
                    first_failure.get_or_insert(err);
                }
            }
        }

        match first_failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bistro_core::AggregateId;
    use chrono::Utc;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Signal {
        Red(AggregateId),
        Green(AggregateId),
    }

    impl Event for Signal {
        fn event_type(&self) -> &'static str {
            match self {
                Signal::Red(_) => "signal.red",
                Signal::Green(_) => "signal.green",
            }
        }

        fn version(&self) -> u32 {
            1
        }

        fn aggregate_id(&self) -> AggregateId {
            match self {
                Signal::Red(id) | Signal::Green(id) => *id,
            }
        }
    }

    struct Recorder {
        name: &'static str,
        types: &'static [&'static str],
        seen: Mutex<Vec<(u64, &'static str)>>,
        fail_on: Option<u64>,
    }

    impl Recorder {
        fn new(name: &'static str, types: &'static [&'static str]) -> Arc<Self> {
            Arc::new(Self {
                name,
                types,
                seen: Mutex::new(Vec::new()),
                fail_on: None,
            })
        }

        fn seen(&self) -> Vec<(u64, &'static str)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Projection<Signal> for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn subscribed_to(&self) -> &'static [&'static str] {
            self.types
        }

        fn handle(&self, envelope: &EventEnvelope<Signal>) -> Result<(), ProjectionError> {
            if self.fail_on == Some(envelope.sequence_number()) {
                return Err(ProjectionError::UnknownInstance {
                    projection: self.name,
                    event_type: envelope.event_type(),
                    aggregate_id: envelope.aggregate_id(),
                });
            }
            self.seen
                .lock()
                .unwrap()
                .push((envelope.sequence_number(), envelope.event_type()));
            Ok(())
        }
    }

    fn envelope(seq: u64, payload: Signal) -> EventEnvelope<Signal> {
        EventEnvelope::new(
            Uuid::now_v7(),
            payload.aggregate_id(),
            "signal",
            seq,
            Utc::now(),
            payload,
        )
    }

    #[test]
    fn routes_by_event_type() {
        let bus = InMemoryEventBus::new();
        let all = Recorder::new("all", &["signal.red", "signal.green"]);
        let reds = Recorder::new("reds", &["signal.red"]);
        bus.subscribe(all.clone()).unwrap();
        bus.subscribe(reds.clone()).unwrap();

        let id = AggregateId::new();
        bus.publish(&envelope(1, Signal::Red(id))).unwrap();
        bus.publish(&envelope(2, Signal::Green(id))).unwrap();
        bus.publish(&envelope(3, Signal::Red(id))).unwrap();

        assert_eq!(
            all.seen(),
            vec![(1, "signal.red"), (2, "signal.green"), (3, "signal.red")]
        );
        assert_eq!(reds.seen(), vec![(1, "signal.red"), (3, "signal.red")]);
        assert_eq!(bus.subscriber_count("signal.red"), 2);
        assert_eq!(bus.subscriber_count("signal.green"), 1);
    }

    #[test]
    fn redelivery_is_skipped() {
        let bus = InMemoryEventBus::new();
        let all = Recorder::new("all", &["signal.red", "signal.green"]);
        bus.subscribe(all.clone()).unwrap();

        let id = AggregateId::new();
        let first = envelope(1, Signal::Red(id));
        bus.publish(&first).unwrap();
        bus.publish(&first).unwrap();

        assert_eq!(all.seen(), vec![(1, "signal.red")]);
    }

    #[test]
    fn publishing_without_subscribers_is_a_no_op() {
        let bus: InMemoryEventBus<Signal> = InMemoryEventBus::new();
        bus.publish(&envelope(1, Signal::Green(AggregateId::new())))
            .unwrap();
    }

    #[test]
    fn failure_is_reported_but_other_subscribers_still_run() {
        let bus = InMemoryEventBus::new();
        let broken = Arc::new(Recorder {
            name: "broken",
            types: &["signal.red"],
            seen: Mutex::new(Vec::new()),
            fail_on: Some(1),
        });
        let healthy = Recorder::new("healthy", &["signal.red"]);
        bus.subscribe(broken.clone()).unwrap();
        bus.subscribe(healthy.clone()).unwrap();

        let err = bus
            .publish(&envelope(1, Signal::Red(AggregateId::new())))
            .unwrap_err();

        assert!(matches!(
            err,
            InMemoryBusError::Projection(ProjectionError::UnknownInstance { projection: "broken", .. })
        ));
        assert_eq!(healthy.seen(), vec![(1, "signal.red")]);
        assert!(broken.seen().is_empty());
    }

    #[test]
    fn failed_delivery_is_not_marked_as_handled() {
        let bus = InMemoryEventBus::new();
        let broken = Arc::new(Recorder {
            name: "broken",
            types: &["signal.red"],
            seen: Mutex::new(Vec::new()),
            fail_on: Some(1),
        });
        bus.subscribe(broken.clone()).unwrap();

        let id = AggregateId::new();
        let first = envelope(1, Signal::Red(id));
        assert!(bus.publish(&first).is_err());
        assert!(bus.publish(&first).is_err());

        // Later envelopes still flow; the failed one stays unhandled.
        bus.publish(&envelope(2, Signal::Red(id))).unwrap();
        assert_eq!(broken.seen(), vec![(2, "signal.red")]);
    }
}
