//! Read model storage for projections.
//!
//! Read models are disposable: they can always be rebuilt from the event store.

pub mod record_map;

pub use record_map::RecordMap;
