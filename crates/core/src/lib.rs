//! `bistro-core`: event-sourcing building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion, rehydrate};
pub use error::{CoreError, CoreResult};
pub use id::AggregateId;
pub use value_object::ValueObject;
