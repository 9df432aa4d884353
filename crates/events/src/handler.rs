/// Execute an aggregate command deterministically (no IO, no locking).
///
/// The canonical event-sourced step:
///
/// 1. **Decide**: `aggregate.handle(command)` produces events without mutating.
/// 2. **Evolve**: each event is applied in emission order.
///
/// If `handle` fails nothing is applied. Useful in unit tests and for inline
/// processing; concurrent callers should go through the infra
/// `CommandDispatcher`, which adds persistence, per-instance serialization and
/// fan-out to projections.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: bistro_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
