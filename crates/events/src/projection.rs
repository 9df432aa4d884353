use thiserror::Error;

use bistro_core::AggregateId;

use crate::{Event, EventEnvelope};

/// Failure while folding an event into a read model.
///
/// Projections perform no validation, so every variant points at a bug: an
/// event delivered out of order, to the wrong projection, or a poisoned lock
/// left behind by a panicking thread.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("{projection}: {event_type} references unknown instance {aggregate_id}")]
    UnknownInstance {
        projection: &'static str,
        event_type: &'static str,
        aggregate_id: AggregateId,
    },

    #[error("{projection}: instance {aggregate_id} has no item {item}")]
    UnknownItem {
        projection: &'static str,
        aggregate_id: AggregateId,
        item: String,
    },

    #[error("{0}: lock poisoned")]
    Poisoned(&'static str),
}

/// A projection builds a read model from the event stream.
///
/// ## Subscription
///
/// `subscribed_to()` lists the event type names (see [`Event::event_type`]) the
/// projection wants. The bus delivers every event of those types, for every
/// aggregate instance, exactly once and in per-instance emission order. Nothing
/// else is delivered, so `handle` must not rely on any other event.
///
/// ## Concurrency
///
/// `handle` takes `&self`: a projection is shared between publishers and
/// readers and owns whatever locking keeps its records consistent. Queries live
/// on the concrete type and must return copies, never references into the
/// guarded state.
pub trait Projection<E: Event>: Send + Sync {
    /// Stable name, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Event type names this projection subscribes to.
    fn subscribed_to(&self) -> &'static [&'static str];

    /// Fold a single event into the read model.
    fn handle(&self, envelope: &EventEnvelope<E>) -> Result<(), ProjectionError>;
}

impl<E, P> Projection<E> for std::sync::Arc<P>
where
    E: Event,
    P: Projection<E> + ?Sized,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn subscribed_to(&self) -> &'static [&'static str] {
        (**self).subscribed_to()
    }

    fn handle(&self, envelope: &EventEnvelope<E>) -> Result<(), ProjectionError> {
        (**self).handle(envelope)
    }
}
