//! Command execution pipeline (application-level orchestration).
//!
//! The `CommandDispatcher` owns the resident aggregate instances and runs every
//! command through the same pipeline:
//!
//! ```text
//! Command
//!   ↓
//! 1. Look up the resident instance (load + rehydrate from the store on first use)
//!   ↓
//! 2. Lock the instance
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events to store (append-only, optimistic concurrency check)
//!   ↓
//! 5. Apply events to the instance, in emission order
//!   ↓
//! 6. Publish events to bus (projections)
//!   ↓
//! 7. Unlock
//! ```
//!
//! Steps 3 to 6 run under the instance lock, so commands for one instance are
//! serialized and its events reach projections in emission order. Commands for
//! different instances only share the brief lookup in step 1.
//!
//! Only live instances stay resident. An instance is dropped from memory once
//! it reaches a terminal state, when a command against a never-written stream
//! is rejected, and when it turns out to lag the store. Removal happens under
//! the instance lock; a command that then acquires the dropped handle notices
//! and looks the instance up again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bistro_core::{Aggregate, AggregateId, AggregateRoot, ExpectedVersion, rehydrate};
use bistro_events::{Event, EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError<E> {
    /// The aggregate rejected the command. Nothing was appended or applied.
    #[error("command rejected: {0}")]
    Domain(E),

    /// Optimistic concurrency failure: the stream moved underneath the
    /// resident instance. The instance has been evicted; retrying reloads it.
    #[error("concurrent modification: {0}")]
    Concurrency(String),

    /// Historical payloads could not be decoded into the aggregate event type.
    #[error("failed to decode history: {0}")]
    Deserialize(String),

    /// Persisting to or loading from the event store failed.
    #[error("event store failure: {0}")]
    Store(EventStoreError),

    /// Publication failed after a successful append and apply.
    ///
    /// The events are committed; a subscriber could not fold them.
    #[error("publication failed: {0}")]
    Publish(String),

    /// An instance lock or the instance table was poisoned.
    #[error("dispatcher lock poisoned")]
    Poisoned,
}

impl<E> From<EventStoreError> for DispatchError<E> {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

type Instances<A> = Mutex<HashMap<AggregateId, Arc<Mutex<A>>>>;

/// Command execution engine for one event-sourced aggregate type.
///
/// ## Execution Guarantees
///
/// - **Atomicity**: events are persisted before they are applied or published;
///   if the append fails, neither happens.
/// - **Isolation**: each command operates on a single aggregate instance, and
///   commands for that instance never interleave.
/// - **Consistency**: a resident instance always equals the fold of its stream
///   as seen by this dispatcher; a concurrency failure evicts it.
///
/// ## Generic Parameters
///
/// - `A`: aggregate type handled by this dispatcher
/// - `S`: event store implementation
/// - `B`: event bus implementation
pub struct CommandDispatcher<A, S, B> {
    store: S,
    bus: B,
    aggregate_type: &'static str,
    make_aggregate: fn(AggregateId) -> A,
    instances: Instances<A>,
}

impl<A, S, B> CommandDispatcher<A, S, B> {
    /// `make_aggregate` builds the initial (empty) state for a fresh instance.
    pub fn new(
        store: S,
        bus: B,
        aggregate_type: &'static str,
        make_aggregate: fn(AggregateId) -> A,
    ) -> Self {
        Self {
            store,
            bus,
            aggregate_type,
            make_aggregate,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    /// Number of instances currently held in memory.
    pub fn resident_count(&self) -> usize {
        self.instances.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Drop `handle` from the table, unless another thread already replaced it.
    fn remove_if_current(&self, aggregate_id: AggregateId, handle: &Arc<Mutex<A>>) -> bool {
        let Ok(mut instances) = self.instances.lock() else {
            return false;
        };
        let current = instances
            .get(&aggregate_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if current {
            instances.remove(&aggregate_id);
        }
        current
    }

    fn evict(&self, aggregate_id: AggregateId, handle: &Arc<Mutex<A>>) {
        if self.remove_if_current(aggregate_id, handle) {
            warn!(%aggregate_id, aggregate_type = self.aggregate_type, "evicted resident instance");
        }
    }

    fn is_resident(
        &self,
        aggregate_id: AggregateId,
        handle: &Arc<Mutex<A>>,
    ) -> Result<bool, DispatchError<A::Error>>
    where
        A: Aggregate,
    {
        let instances = self.instances.lock().map_err(|_| DispatchError::Poisoned)?;
        Ok(instances
            .get(&aggregate_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle)))
    }
}

impl<A, S, B> CommandDispatcher<A, S, B>
where
    A: Aggregate,
    A::Event: Event + Serialize + DeserializeOwned,
    S: EventStore,
    B: EventBus<EventEnvelope<A::Event>>,
{
    /// Run `command` against instance `aggregate_id`.
    ///
    /// Returns the committed envelopes, in emission order. A command that
    /// decides no events commits nothing and returns an empty vector.
    pub fn dispatch(
        &self,
        aggregate_id: AggregateId,
        command: A::Command,
    ) -> Result<Vec<EventEnvelope<A::Event>>, DispatchError<A::Error>> {
        loop {
            let handle = self.instance(aggregate_id)?;
            let aggregate = match handle.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.evict(aggregate_id, &handle);
                    return Err(DispatchError::Poisoned);
                }
            };
            if !self.is_resident(aggregate_id, &handle)? {
                // Dropped while this thread waited for the lock.
                continue;
            }
            return self.run_locked(aggregate_id, &handle, aggregate, &command);
        }
    }

    fn run_locked(
        &self,
        aggregate_id: AggregateId,
        handle: &Arc<Mutex<A>>,
        mut aggregate: MutexGuard<'_, A>,
        command: &A::Command,
    ) -> Result<Vec<EventEnvelope<A::Event>>, DispatchError<A::Error>> {
        let decided = match aggregate.handle(command) {
            Ok(events) => events,
            Err(err) => {
                warn!(%aggregate_id, ?command, error = ?err, "command rejected");
                self.retire_if_settled(aggregate_id, handle, &aggregate);
                return Err(DispatchError::Domain(err));
            }
        };
        if decided.is_empty() {
            debug!(%aggregate_id, ?command, "command decided no events");
            return Ok(Vec::new());
        }

        let expected = ExpectedVersion::Exact(aggregate.version());
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(self.aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = match self.store.append(uncommitted, expected) {
            Ok(committed) => committed,
            Err(err) => {
                if matches!(err, EventStoreError::Concurrency(_)) {
                    self.evict(aggregate_id, handle);
                }
                return Err(err.into());
            }
        };

        let mut envelopes = Vec::with_capacity(committed.len());
        for (stored, event) in committed.into_iter().zip(decided) {
            aggregate.apply(&event);
            info!(
                %aggregate_id,
                event_type = event.event_type(),
                sequence_number = stored.sequence_number,
                "event committed"
            );
            envelopes.push(stored.into_envelope(event));
        }

        // Every event goes out even if one fails; the first failure is reported.
        let mut publish_failure = None;
        for envelope in &envelopes {
            if let Err(err) = self.bus.publish(envelope) {
                if publish_failure.is_none() {
                    publish_failure = Some(format!("{err:?}"));
                }
            }
        }
        self.retire_if_settled(aggregate_id, handle, &aggregate);
        drop(aggregate);

        match publish_failure {
            Some(msg) => Err(DispatchError::Publish(msg)),
            None => Ok(envelopes),
        }
    }

    /// Drop instances with nothing left to do: terminal ones, and empty ones
    /// whose stream was never written.
    fn retire_if_settled(&self, aggregate_id: AggregateId, handle: &Arc<Mutex<A>>, aggregate: &A) {
        if (aggregate.version() == 0 || aggregate.is_terminal())
            && self.remove_if_current(aggregate_id, handle)
        {
            debug!(
                %aggregate_id,
                aggregate_type = self.aggregate_type,
                version = aggregate.version(),
                "retired resident instance"
            );
        }
    }

    /// Read the current state of an instance (loading it if not resident).
    pub fn with_instance<R>(
        &self,
        aggregate_id: AggregateId,
        f: impl FnOnce(&A) -> R,
    ) -> Result<R, DispatchError<A::Error>> {
        let handle = self.instance(aggregate_id)?;
        let aggregate = handle.lock().map_err(|_| DispatchError::Poisoned)?;
        let out = f(&aggregate);
        self.retire_if_settled(aggregate_id, &handle, &aggregate);
        Ok(out)
    }

    /// Resident handle for `aggregate_id`, rehydrating it from the store on
    /// first use.
    ///
    /// The table lock is only held for the lookup and the insert, never while
    /// the stream is loaded and folded. When two threads load the same
    /// instance, the first insert wins.
    fn instance(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Arc<Mutex<A>>, DispatchError<A::Error>> {
        {
            let instances = self.instances.lock().map_err(|_| DispatchError::Poisoned)?;
            if let Some(handle) = instances.get(&aggregate_id) {
                return Ok(Arc::clone(handle));
            }
        }

        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, self.aggregate_type, &history)?;
        let events = history
            .iter()
            .map(StoredEvent::decode_payload::<A::Event>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;

        let aggregate = rehydrate((self.make_aggregate)(aggregate_id), &events);
        debug!(
            %aggregate_id,
            aggregate_type = self.aggregate_type,
            version = aggregate.version(),
            "instance loaded"
        );

        let mut instances = self.instances.lock().map_err(|_| DispatchError::Poisoned)?;
        let handle = instances
            .entry(aggregate_id)
            .or_insert_with(|| Arc::new(Mutex::new(aggregate)));
        Ok(Arc::clone(handle))
    }
}

impl<A, S, B> core::fmt::Debug for CommandDispatcher<A, S, B>
where
    S: core::fmt::Debug,
    B: core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("aggregate_type", &self.aggregate_type)
            .field("resident", &self.resident_count())
            .field("store", &self.store)
            .field("bus", &self.bus)
            .finish()
    }
}

/// A loaded stream must belong to `aggregate_id`, carry one aggregate type, and
/// number its events 1, 2, 3, ... with no gaps.
fn validate_loaded_stream<E>(
    aggregate_id: AggregateId,
    aggregate_type: &str,
    stream: &[StoredEvent],
) -> Result<(), DispatchError<E>> {
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.aggregate_type != aggregate_type {
            return Err(DispatchError::Store(EventStoreError::AggregateTypeMismatch(
                format!(
                    "loaded stream has aggregate_type '{}', expected '{aggregate_type}'",
                    e.aggregate_type
                ),
            )));
        }
        let expected = idx as u64 + 1;
        if e.sequence_number != expected {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-contiguous sequence_number in loaded stream (expected={expected}, found={})",
                e.sequence_number
            ))));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::panic::{self, AssertUnwindSafe};

    use bistro_billing::{
        AGGREGATE_TYPE, Bill, BillCommand, BillError, BillEvent, BillId, BillOpened, BillStatus,
        CloseBill, DrinksOrdered, DrinksServed, MarkDrinksServed, Money, OpenBill, OrderedItem,
        PlaceOrder,
    };
    use bistro_events::InMemoryEventBus;
    use rust_decimal::Decimal;
    use serde_json::json;

    use crate::event_store::InMemoryEventStore;

    type Dispatcher =
        CommandDispatcher<Bill, Arc<InMemoryEventStore>, Arc<InMemoryEventBus<BillEvent>>>;

    fn dispatcher(store: Arc<InMemoryEventStore>) -> Dispatcher {
        CommandDispatcher::new(
            store,
            Arc::new(InMemoryEventBus::new()),
            AGGREGATE_TYPE,
            |id| Bill::empty(BillId::new(id)),
        )
    }

    fn open(bill_id: BillId, table_number: u32) -> BillCommand {
        BillCommand::OpenBill(OpenBill {
            bill_id,
            table_number,
            waiter: "Ada".to_string(),
        })
    }

    fn order(bill_id: BillId, price: Money) -> BillCommand {
        BillCommand::PlaceOrder(PlaceOrder {
            bill_id,
            items: vec![OrderedItem {
                menu_number: 1,
                description: "House red".to_string(),
                is_drink: true,
                price,
            }],
        })
    }

    fn serve_drinks(bill_id: BillId, menu_numbers: &[u32]) -> BillCommand {
        BillCommand::MarkDrinksServed(MarkDrinksServed {
            bill_id,
            menu_numbers: menu_numbers.to_vec(),
        })
    }

    fn close(bill_id: BillId, amount_paid: Money) -> BillCommand {
        BillCommand::CloseBill(CloseBill {
            bill_id,
            amount_paid,
        })
    }

    #[test]
    fn dispatch_commits_applies_and_returns_envelopes() {
        let store = Arc::new(InMemoryEventStore::new());
        let d = dispatcher(Arc::clone(&store));
        let bill_id = BillId::new(AggregateId::new());

        let envelopes = d.dispatch(bill_id.0, open(bill_id, 4)).unwrap();

        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].sequence_number(), 1);
        assert_eq!(envelopes[0].aggregate_type(), AGGREGATE_TYPE);
        assert_eq!(store.load_stream(bill_id.0).unwrap().len(), 1);
        let (status, version) = d
            .with_instance(bill_id.0, |b| (b.status(), b.version()))
            .unwrap();
        assert_eq!(status, BillStatus::Open);
        assert_eq!(version, 1);
    }

    #[test]
    fn rejected_command_appends_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let d = dispatcher(Arc::clone(&store));
        let bill_id = BillId::new(AggregateId::new());
        d.dispatch(bill_id.0, open(bill_id, 4)).unwrap();

        let err = d.dispatch(bill_id.0, open(bill_id, 4)).unwrap_err();

        assert!(matches!(err, DispatchError::Domain(BillError::AlreadyOpened)));
        assert_eq!(store.load_stream(bill_id.0).unwrap().len(), 1);
        assert_eq!(d.with_instance(bill_id.0, |b| b.version()).unwrap(), 1);
    }

    #[test]
    fn rehydrates_from_existing_stream_on_first_use() {
        let store = Arc::new(InMemoryEventStore::new());
        let bill_id = BillId::new(AggregateId::new());
        dispatcher(Arc::clone(&store))
            .dispatch(bill_id.0, open(bill_id, 9))
            .unwrap();

        let fresh = dispatcher(Arc::clone(&store));
        assert_eq!(fresh.resident_count(), 0);
        let table = fresh
            .with_instance(bill_id.0, |b| b.table_number())
            .unwrap();

        assert_eq!(table, Some(9));
        assert_eq!(fresh.resident_count(), 1);
    }

    #[test]
    fn stale_instance_is_evicted_and_reloaded() {
        let store = Arc::new(InMemoryEventStore::new());
        let first = dispatcher(Arc::clone(&store));
        let second = dispatcher(Arc::clone(&store));
        let bill_id = BillId::new(AggregateId::new());
        first.dispatch(bill_id.0, open(bill_id, 2)).unwrap();

        // `second` caches the opened bill, then `first` moves the stream on.
        assert_eq!(second.with_instance(bill_id.0, |b| b.version()).unwrap(), 1);
        first.dispatch(bill_id.0, order(bill_id, Money::from_cents(300))).unwrap();

        let err = second
            .dispatch(bill_id.0, order(bill_id, Money::from_cents(300)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency(_)));
        assert_eq!(second.resident_count(), 0);

        // The reload sees the first order.
        let envelopes = second
            .dispatch(bill_id.0, order(bill_id, Money::from_cents(300)))
            .unwrap();
        assert_eq!(envelopes[0].sequence_number(), 3);
    }

    #[test]
    fn closed_and_never_opened_instances_are_not_kept_resident() {
        let store = Arc::new(InMemoryEventStore::new());
        let d = dispatcher(Arc::clone(&store));
        let bill_id = BillId::new(AggregateId::new());

        // Rejected against an empty stream: nothing worth keeping.
        let err = d
            .dispatch(bill_id.0, order(bill_id, Money::from_cents(100)))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Domain(BillError::PreconditionNotOpen { .. })));
        assert_eq!(d.resident_count(), 0);
        assert_eq!(d.with_instance(AggregateId::new(), |b| b.version()).unwrap(), 0);
        assert_eq!(d.resident_count(), 0);

        d.dispatch(bill_id.0, open(bill_id, 6)).unwrap();
        assert_eq!(d.resident_count(), 1);

        d.dispatch(bill_id.0, close(bill_id, Money::ZERO)).unwrap();
        assert_eq!(d.resident_count(), 0);

        // A later command reloads the closed bill and is rejected.
        let err = d
            .dispatch(bill_id.0, close(bill_id, Money::ZERO))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Domain(BillError::PreconditionNotOpen {
                status: BillStatus::Closed
            })
        ));
        assert_eq!(d.resident_count(), 0);
        assert_eq!(store.load_stream(bill_id.0).unwrap().len(), 2);
    }

    #[test]
    fn overflowing_order_is_rejected_before_anything_is_committed() {
        let store = Arc::new(InMemoryEventStore::new());
        let d = dispatcher(Arc::clone(&store));
        let bill_id = BillId::new(AggregateId::new());
        d.dispatch(bill_id.0, open(bill_id, 1)).unwrap();
        d.dispatch(bill_id.0, order(bill_id, Money::new(Decimal::MAX)))
            .unwrap();

        let err = d
            .dispatch(bill_id.0, order(bill_id, Money::new(Decimal::MAX)))
            .unwrap_err();

        assert!(matches!(err, DispatchError::Domain(BillError::AmountOverflow)));
        assert_eq!(store.load_stream(bill_id.0).unwrap().len(), 2);

        // The bill and its neighbours keep working.
        d.dispatch(bill_id.0, serve_drinks(bill_id, &[1])).unwrap();
        let other = BillId::new(AggregateId::new());
        d.dispatch(other.0, open(other, 2)).unwrap();
    }

    #[test]
    fn failed_load_leaves_other_instances_available() {
        let store = Arc::new(InMemoryEventStore::new());
        let bill_id = BillId::new(AggregateId::new());
        // A history no bill would accept: serving these overflows the total.
        let item = OrderedItem {
            menu_number: 1,
            description: "Vintage".to_string(),
            is_drink: true,
            price: Money::new(Decimal::MAX),
        };
        let history = [
            BillEvent::BillOpened(BillOpened {
                bill_id,
                table_number: 1,
                waiter: "Ada".to_string(),
            }),
            BillEvent::DrinksOrdered(DrinksOrdered {
                bill_id,
                items: vec![item.clone(), item],
            }),
            BillEvent::DrinksServed(DrinksServed {
                bill_id,
                menu_numbers: vec![1, 1],
            }),
        ];
        let uncommitted = history
            .iter()
            .map(|e| UncommittedEvent::from_typed(AGGREGATE_TYPE, Uuid::now_v7(), e).unwrap())
            .collect();
        store
            .append(uncommitted, ExpectedVersion::Exact(0))
            .unwrap();

        let d = dispatcher(store);
        let loaded = panic::catch_unwind(AssertUnwindSafe(|| {
            d.with_instance(bill_id.0, |b| b.version())
        }));
        assert!(loaded.is_err());

        let other = BillId::new(AggregateId::new());
        d.dispatch(other.0, open(other, 2)).unwrap();
        assert_eq!(d.resident_count(), 1);
    }

    #[test]
    fn corrupt_history_is_reported() {
        let store = Arc::new(InMemoryEventStore::new());
        let bill_id = BillId::new(AggregateId::new());
        store
            .append(
                vec![UncommittedEvent {
                    event_id: Uuid::now_v7(),
                    aggregate_id: bill_id.0,
                    aggregate_type: AGGREGATE_TYPE.to_string(),
                    event_type: "restaurant.bill.opened".to_string(),
                    event_version: 1,
                    payload: json!({ "not": "a bill event" }),
                }],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let err = dispatcher(store)
            .dispatch(bill_id.0, open(bill_id, 1))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Deserialize(_)));
    }

    #[test]
    fn foreign_stream_type_is_rejected() {
        let store = Arc::new(InMemoryEventStore::new());
        let id = AggregateId::new();
        store
            .append(
                vec![UncommittedEvent {
                    event_id: Uuid::now_v7(),
                    aggregate_id: id,
                    aggregate_type: "restaurant.table".to_string(),
                    event_type: "restaurant.table.reserved".to_string(),
                    event_version: 1,
                    payload: json!({}),
                }],
                ExpectedVersion::Exact(0),
            )
            .unwrap();

        let err = dispatcher(store)
            .with_instance(id, |b| b.version())
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Store(EventStoreError::AggregateTypeMismatch(_))
        ));
    }
}
