//! Event, command and projection plumbing shared by the write and read sides.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;

pub use bus::EventBus;
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::{Projection, ProjectionError};
pub use runner::{CursorTable, ProjectionCursor, ProjectionRunner};
