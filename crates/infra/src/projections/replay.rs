//! Projection replay for rebuilding read models from the event store.
//!
//! Read models are disposable. Replaying the store's full history, in commit
//! order, into a fresh projection yields the same state the live projection
//! reached by subscription.

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::info;

use bistro_events::{Event, Projection, ProjectionError, ProjectionRunner};

use crate::event_store::{EventStore, EventStoreError};

/// Error type for projection replay operations.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("projection error: {0}")]
    Projection(#[from] ProjectionError),
}

/// Outcome of a completed replay.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Events of the requested aggregate type found in the store.
    pub events_read: usize,
    /// Events the projection subscribed to and handled.
    pub events_handled: usize,
}

/// Replay every stored event of `aggregate_type` into `projection`.
pub fn rebuild_projection<P, E, S>(
    store: &S,
    aggregate_type: &str,
    projection: P,
) -> Result<(P, ReplaySummary), ReplayError>
where
    P: Projection<E>,
    E: Event + DeserializeOwned,
    S: EventStore + ?Sized,
{
    let envelopes = store
        .load_all()?
        .iter()
        .filter(|stored| stored.aggregate_type == aggregate_type)
        .map(|stored| stored.to_envelope::<E>())
        .collect::<Result<Vec<_>, _>>()?;

    let runner = ProjectionRunner::new::<E>(projection);
    let events_handled = runner.run(&envelopes)?;
    let summary = ReplaySummary {
        events_read: envelopes.len(),
        events_handled,
    };
    info!(
        projection = runner.projection().name(),
        events_read = summary.events_read,
        events_handled = summary.events_handled,
        "projection rebuilt"
    );

    Ok((runner.into_projection(), summary))
}
