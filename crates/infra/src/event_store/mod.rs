//! Append-only event store boundary.
//!
//! Durable storage is an external collaborator; this module defines the
//! contract the dispatcher needs and an in-memory implementation of it.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
