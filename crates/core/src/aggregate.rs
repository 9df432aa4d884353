//! Aggregate traits for event-sourced domain models.

use crate::error::{CoreError, CoreResult};

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events applied to this instance so far.
    ///
    /// Matches the sequence number of the last event in the instance's stream.
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> CoreResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(CoreError::VersionConflict {
                expected: self,
                actual,
            })
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// `handle` takes `&self`, so a rejected command can never leave a trace on the
/// instance. The only way state changes is through `apply`, which makes the live
/// state equal to the fold of everything applied so far.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Evolve in-memory state from a single event.
    ///
    /// Must be deterministic and bump `version()` by one.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Whether the instance has reached an end state and will accept no
    /// further events.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Fold an ordered event history into a fresh aggregate instance.
pub fn rehydrate<'a, A>(mut aggregate: A, history: impl IntoIterator<Item = &'a A::Event>) -> A
where
    A: Aggregate,
    A::Event: 'a,
{
    for event in history {
        aggregate.apply(event);
    }
    aggregate
}
