//! Event publishing abstraction (mechanics only).
//!
//! The bus sits between the command dispatcher and the read side:
//!
//! ```text
//! Command → Aggregate → Event Store (append) → Event Bus (publish) → Projections
//! ```
//!
//! Events are **stored first**, then published, so a failed publication never
//! loses an event. In this in-process runtime publication is synchronous: when
//! `publish` returns, every subscriber has seen the event.

use std::sync::Arc;

/// Transport-agnostic publisher.
///
/// Implementations must be shareable across threads. Ordering between two
/// `publish` calls is preserved per subscriber; callers that need per-instance
/// ordering (the dispatcher does) must not publish events of one instance from
/// two threads at once.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: &M) -> Result<(), Self::Error>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: &M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }
}
