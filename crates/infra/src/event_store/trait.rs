use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use bistro_core::{AggregateId, ExpectedVersion};
use bistro_events::EventEnvelope;
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: created by the aggregate's `handle()`
/// 2. **UncommittedEvent**: serialized and wrapped with stream metadata
/// 3. **StoredEvent**: persisted with an assigned `sequence_number`
/// 4. **EventEnvelope**: typed again and published to projections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are:
/// - **1-based and contiguous** within a stream
/// - **stream-scoped**: one counter per aggregate instance
/// - **immutable** once assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub recorded_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Deserialize the payload into the aggregate's event type.
    pub fn decode_payload<E: DeserializeOwned>(&self) -> Result<E, EventStoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::Serialization(format!(
                "{} #{} of {}: {e}",
                self.event_type, self.sequence_number, self.aggregate_id
            ))
        })
    }

    /// Pair the stored metadata with its typed payload for publication.
    pub fn into_envelope<E>(self, payload: E) -> EventEnvelope<E> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type,
            self.sequence_number,
            self.recorded_at,
            payload,
        )
    }

    /// Decode the payload and wrap it in an envelope.
    pub fn to_envelope<E: DeserializeOwned>(&self) -> Result<EventEnvelope<E>, EventStoreError> {
        let payload = self.decode_payload()?;
        Ok(self.clone().into_envelope(payload))
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** as opposed to domain rejections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("payload serialization failed: {0}")]
    Serialization(String),

    #[error("event store lock poisoned")]
    Poisoned,
}

/// Append-only event store (the durable-log collaborator).
///
/// Events are organized into **streams**, one per aggregate instance.
///
/// `append()`:
/// - requires every event in the batch to target the same stream
/// - checks `expected_version` against the current stream version
/// - assigns sequence numbers starting at `current_version + 1`
/// - persists the batch atomically (all or nothing)
///
/// `load_stream()` returns a stream in sequence order, or an empty vector for
/// an instance that has no events yet. `load_all()` returns every event in
/// commit order, for rebuilding read models.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_all()
    }
}

impl UncommittedEvent {
    /// Build an uncommitted event from a typed domain event.
    pub fn from_typed<E>(
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: bistro_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        Ok(Self {
            event_id,
            aggregate_id: event.aggregate_id(),
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            payload,
        })
    }
}
