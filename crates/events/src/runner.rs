//! Projection progress tracking and replay.
//!
//! Read models are **disposable**; events are the source of truth. A cursor
//! records, per aggregate instance, the last sequence number a projection has
//! handled successfully. Anything at or below the cursor is a duplicate and is
//! skipped. An envelope whose handler failed leaves the cursor where it was, so
//! delivering it again retries it.

use std::collections::HashMap;
use std::sync::Mutex;

use bistro_core::AggregateId;

use crate::{Event, EventEnvelope, Projection, ProjectionError};

/// Progress of one projection on one aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProjectionCursor {
    aggregate_id: AggregateId,
    last_sequence_number: u64,
}

impl ProjectionCursor {
    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.last_sequence_number
    }
}

/// Per-instance cursors for a single subscriber.
///
/// Check with [`CursorTable::is_new`], handle, then [`CursorTable::advance`].
/// Deliveries for one instance must not overlap; the command dispatcher
/// publishes them under the instance lock.
#[derive(Debug, Default)]
pub struct CursorTable {
    name: &'static str,
    cursors: Mutex<HashMap<AggregateId, u64>>,
}

impl CursorTable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `sequence_number` is past the cursor, i.e. not yet handled.
    pub fn is_new(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<bool, ProjectionError> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|_| ProjectionError::Poisoned(self.name))?;
        Ok(cursors
            .get(&aggregate_id)
            .is_none_or(|last| sequence_number > *last))
    }

    /// Record `sequence_number` as handled. The cursor never moves back.
    pub fn advance(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<(), ProjectionError> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| ProjectionError::Poisoned(self.name))?;
        let last = cursors.entry(aggregate_id).or_insert(0);
        *last = (*last).max(sequence_number);
        Ok(())
    }

    /// Hand `envelope` to `projection` unless it was already handled.
    ///
    /// Returns whether the projection handled it. The cursor moves only once
    /// `handle` succeeds.
    pub fn deliver<E, P>(
        &self,
        projection: &P,
        envelope: &EventEnvelope<E>,
    ) -> Result<bool, ProjectionError>
    where
        E: Event,
        P: Projection<E> + ?Sized,
    {
        let aggregate_id = envelope.aggregate_id();
        let sequence_number = envelope.sequence_number();
        if !self.is_new(aggregate_id, sequence_number)? {
            return Ok(false);
        }
        projection.handle(envelope)?;
        self.advance(aggregate_id, sequence_number)?;
        Ok(true)
    }

    pub fn cursor(&self, aggregate_id: AggregateId) -> Option<ProjectionCursor> {
        let cursors = self.cursors.lock().ok()?;
        cursors.get(&aggregate_id).map(|last| ProjectionCursor {
            aggregate_id,
            last_sequence_number: *last,
        })
    }
}

/// Drives a projection through an ordered history, e.g. to rebuild a read
/// model from the event store.
#[derive(Debug)]
pub struct ProjectionRunner<P> {
    projection: P,
    cursors: CursorTable,
}

impl<P> ProjectionRunner<P> {
    pub fn projection(&self) -> &P {
        &self.projection
    }

    pub fn into_projection(self) -> P {
        self.projection
    }
}

impl<P> ProjectionRunner<P> {
    pub fn new<E>(projection: P) -> Self
    where
        E: Event,
        P: Projection<E>,
    {
        let name = projection.name();
        Self {
            projection,
            cursors: CursorTable::new(name),
        }
    }

    pub fn cursor(&self, aggregate_id: AggregateId) -> Option<ProjectionCursor> {
        self.cursors.cursor(aggregate_id)
    }

    /// Apply one envelope if the projection subscribes to its type and has not
    /// seen it yet. Returns whether the projection handled it.
    pub fn apply<E>(&self, envelope: &EventEnvelope<E>) -> Result<bool, ProjectionError>
    where
        E: Event,
        P: Projection<E>,
    {
        if !self
            .projection
            .subscribed_to()
            .contains(&envelope.event_type())
        {
            return Ok(false);
        }
        self.cursors.deliver(&self.projection, envelope)
    }

    /// Apply many envelopes in order; returns how many were handled.
    pub fn run<'a, E>(
        &self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<E>>,
    ) -> Result<usize, ProjectionError>
    where
        E: Event,
        P: Projection<E>,
    {
        let mut handled = 0;
        for env in envelopes {
            if self.apply(env)? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Build a fresh projection and replay the full history into it.
    pub fn rebuild_from_scratch<'a, E>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<E>>,
    ) -> Result<P, ProjectionError>
    where
        E: Event,
        P: Projection<E>,
    {
        let runner = ProjectionRunner::new::<E>(factory());
        runner.run(envelopes)?;
        Ok(runner.projection)
    }
}
