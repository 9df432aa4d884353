use bistro_core::AggregateId;

/// A command targets a specific aggregate instance.
///
/// Commands represent **intent**. They are transient: the owning aggregate either
/// turns one into events or rejects it, and the command is then discarded.
///
/// `target_aggregate_id()` is what the dispatcher routes on, so each command
/// operates on exactly one instance (the transaction boundary).
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
