use bistro_core::AggregateId;

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema version travels with the stored payload)
/// - tagged with the aggregate instance they belong to
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "restaurant.bill.opened").
    ///
    /// Subscriptions are keyed on this value.
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// Aggregate instance the event belongs to.
    fn aggregate_id(&self) -> AggregateId;
}
