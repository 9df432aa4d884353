//! Open Bills Projection.
//!
//! Tracks every bill between `BillOpened` and `BillClosed`, with its items
//! split by where they are: waiting to be served, being prepared, or served.
//! Answers the waiter's and the cashier's questions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bistro_billing::{BillEvent, BillId, Money, OrderedItem, event_types};
use bistro_events::{EventEnvelope, Projection, ProjectionError};

use crate::read_model::RecordMap;

pub const OPEN_BILLS: &str = "restaurant.open_bills";

const SUBSCRIBED: &[&str] = &[
    event_types::BILL_OPENED,
    event_types::DRINKS_ORDERED,
    event_types::FOOD_ORDERED,
    event_types::DRINKS_SERVED,
    event_types::FOOD_PREPARED,
    event_types::FOOD_SERVED,
    event_types::BILL_CLOSED,
];

/// Read model: one item on a bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillItem {
    pub menu_number: u32,
    pub description: String,
    pub price: Money,
}

impl From<&OrderedItem> for BillItem {
    fn from(item: &OrderedItem) -> Self {
        Self {
            menu_number: item.menu_number,
            description: item.description.clone(),
            price: item.price,
        }
    }
}

/// Read model: where every item of an open bill currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillOverview {
    pub bill_id: BillId,
    pub table_number: u32,
    pub waiter: String,
    pub to_serve: Vec<BillItem>,
    pub in_preparation: Vec<BillItem>,
    pub served: Vec<BillItem>,
}

/// Read model: what the table owes so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillInvoice {
    pub bill_id: BillId,
    pub table_number: u32,
    pub items: Vec<BillItem>,
    pub total: Money,
    pub has_unserved_items: bool,
}

#[derive(Debug, Clone)]
struct BillRecord {
    opened_at: DateTime<Utc>,
    table_number: u32,
    waiter: String,
    to_serve: Vec<BillItem>,
    in_preparation: Vec<BillItem>,
    served: Vec<BillItem>,
}

/// Open bills projection: per-bill item buckets.
///
/// - Bills enter on `BillOpened` and leave on `BillClosed`
/// - Drinks ordered go straight to `to_serve`; food goes to `in_preparation`
/// - Prepared food moves to `to_serve`; served items move to `served`
///
/// Each bill is its own record, so events for different bills fold in
/// parallel. Rebuildable from bill events.
///
/// Nothing stops two bills being open on one table. The per-table queries
/// then answer for the bill opened first (earliest `BillOpened` commit time,
/// ties broken by bill id), which is the same live and after a rebuild.
#[derive(Debug)]
pub struct OpenBills {
    bills: RecordMap<BillId, BillRecord>,
}

impl Default for OpenBills {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenBills {
    pub fn new() -> Self {
        Self {
            bills: RecordMap::new(OPEN_BILLS),
        }
    }

    /// Tables with an open bill, ascending.
    pub fn active_table_numbers(&self) -> Vec<u32> {
        let mut tables = self.bills.scan(|_, bill| Some(bill.table_number));
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    /// Items ready to take to each of `waiter`'s tables, keyed by table.
    ///
    /// Tables with nothing to serve are left out.
    pub fn todo_list_for_waiter(&self, waiter: &str) -> BTreeMap<u32, Vec<BillItem>> {
        self.bills
            .scan(|_, bill| {
                (bill.waiter == waiter && !bill.to_serve.is_empty())
                    .then(|| (bill.table_number, bill.to_serve.clone()))
            })
            .into_iter()
            .collect()
    }

    pub fn bill_id_for_table(&self, table_number: u32) -> Option<BillId> {
        self.bill_on_table(table_number).map(|(bill_id, _)| bill_id)
    }

    pub fn bill_for_table(&self, table_number: u32) -> Option<BillOverview> {
        let (bill_id, bill) = self.bill_on_table(table_number)?;
        Some(BillOverview {
            bill_id,
            table_number: bill.table_number,
            waiter: bill.waiter,
            to_serve: bill.to_serve,
            in_preparation: bill.in_preparation,
            served: bill.served,
        })
    }

    /// Served items and their total; unserved items are not charged.
    pub fn invoice_for_table(&self, table_number: u32) -> Option<BillInvoice> {
        let (bill_id, bill) = self.bill_on_table(table_number)?;
        let total = bill.served.iter().map(|item| item.price).sum();
        Some(BillInvoice {
            bill_id,
            table_number: bill.table_number,
            has_unserved_items: !bill.to_serve.is_empty() || !bill.in_preparation.is_empty(),
            items: bill.served,
            total,
        })
    }

    /// First-opened bill on `table_number`.
    fn bill_on_table(&self, table_number: u32) -> Option<(BillId, BillRecord)> {
        self.bills
            .scan(|bill_id, bill| {
                (bill.table_number == table_number).then(|| (*bill_id, bill.clone()))
            })
            .into_iter()
            .min_by_key(|(bill_id, bill)| (bill.opened_at, *bill_id))
    }

    fn update_bill<R>(
        &self,
        envelope: &EventEnvelope<BillEvent>,
        bill_id: BillId,
        f: impl FnOnce(&mut BillRecord) -> R,
    ) -> Result<R, ProjectionError> {
        self.bills
            .update(&bill_id, f)?
            .ok_or_else(|| ProjectionError::UnknownInstance {
                projection: OPEN_BILLS,
                event_type: envelope.event_type(),
                aggregate_id: bill_id.0,
            })
    }

    /// Move the named items between buckets of one bill. Either every item
    /// moves or none does.
    fn move_items(
        &self,
        envelope: &EventEnvelope<BillEvent>,
        bill_id: BillId,
        menu_numbers: &[u32],
        buckets: fn(&mut BillRecord) -> (&mut Vec<BillItem>, &mut Vec<BillItem>),
    ) -> Result<(), ProjectionError> {
        self.update_bill(envelope, bill_id, |bill| {
            let (from, to) = buckets(bill);
            transfer(from, to, menu_numbers)
        })?
        .map_err(|menu_number| ProjectionError::UnknownItem {
            projection: OPEN_BILLS,
            aggregate_id: bill_id.0,
            item: format!("#{menu_number}"),
        })
    }
}

/// Move one entry per requested menu number (first match first) from `from`
/// to `to`. On a miss nothing moves and the missing number is returned.
fn transfer(
    from: &mut Vec<BillItem>,
    to: &mut Vec<BillItem>,
    menu_numbers: &[u32],
) -> Result<(), u32> {
    let mut remaining = from.clone();
    let mut moved = Vec::with_capacity(menu_numbers.len());
    for &menu_number in menu_numbers {
        let idx = remaining
            .iter()
            .position(|item| item.menu_number == menu_number)
            .ok_or(menu_number)?;
        moved.push(remaining.remove(idx));
    }
    *from = remaining;
    to.extend(moved);
    Ok(())
}

impl Projection<BillEvent> for OpenBills {
    fn name(&self) -> &'static str {
        OPEN_BILLS
    }

    fn subscribed_to(&self) -> &'static [&'static str] {
        SUBSCRIBED
    }

    fn handle(&self, envelope: &EventEnvelope<BillEvent>) -> Result<(), ProjectionError> {
        match envelope.payload() {
            BillEvent::BillOpened(e) => self.bills.insert(
                e.bill_id,
                BillRecord {
                    opened_at: envelope.recorded_at(),
                    table_number: e.table_number,
                    waiter: e.waiter.clone(),
                    to_serve: Vec::new(),
                    in_preparation: Vec::new(),
                    served: Vec::new(),
                },
            ),
            BillEvent::DrinksOrdered(e) => self.update_bill(envelope, e.bill_id, |bill| {
                bill.to_serve.extend(e.items.iter().map(BillItem::from));
            }),
            BillEvent::FoodOrdered(e) => self.update_bill(envelope, e.bill_id, |bill| {
                bill.in_preparation.extend(e.items.iter().map(BillItem::from));
            }),
            BillEvent::FoodPrepared(e) => {
                self.move_items(envelope, e.bill_id, &e.menu_numbers, |bill| {
                    (&mut bill.in_preparation, &mut bill.to_serve)
                })
            }
            BillEvent::DrinksServed(e) => {
                self.move_items(envelope, e.bill_id, &e.menu_numbers, |bill| {
                    (&mut bill.to_serve, &mut bill.served)
                })
            }
            BillEvent::FoodServed(e) => {
                self.move_items(envelope, e.bill_id, &e.menu_numbers, |bill| {
                    (&mut bill.to_serve, &mut bill.served)
                })
            }
            BillEvent::BillClosed(e) => {
                if self.bills.remove(&e.bill_id)? {
                    Ok(())
                } else {
                    Err(ProjectionError::UnknownInstance {
                        projection: OPEN_BILLS,
                        event_type: envelope.event_type(),
                        aggregate_id: e.bill_id.0,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bistro_billing::{
        BillClosed, BillOpened, DrinksOrdered, DrinksServed, FoodOrdered, FoodPrepared,
        FoodServed,
    };
    use bistro_core::AggregateId;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct Feed {
        bill_id: BillId,
        seq: u64,
    }

    impl Feed {
        fn new() -> Self {
            Self {
                bill_id: BillId::new(AggregateId::new()),
                seq: 0,
            }
        }

        fn next(&mut self, event: BillEvent) -> EventEnvelope<BillEvent> {
            self.seq += 1;
            EventEnvelope::new(
                Uuid::now_v7(),
                self.bill_id.0,
                bistro_billing::AGGREGATE_TYPE,
                self.seq,
                Utc::now(),
                event,
            )
        }
    }

    fn item(menu_number: u32, description: &str, is_drink: bool, price: Money) -> OrderedItem {
        OrderedItem {
            menu_number,
            description: description.to_string(),
            is_drink,
            price,
        }
    }

    fn opened(p: &OpenBills, feed: &mut Feed, table_number: u32, waiter: &str) {
        let env = feed.next(BillEvent::BillOpened(BillOpened {
            bill_id: feed.bill_id,
            table_number,
            waiter: waiter.to_string(),
        }));
        p.handle(&env).unwrap();
    }

    #[test]
    fn shared_table_answers_for_the_first_opened_bill() {
        let p = OpenBills::new();
        let mut early = Feed::new();
        let mut late = Feed::new();
        let opened_at = Utc::now();

        // Handled out of commit order: the later bill reaches the projection first.
        for (feed, at, waiter) in [
            (&mut late, opened_at + chrono::Duration::seconds(5), "Grace"),
            (&mut early, opened_at, "Ada"),
        ] {
            feed.seq += 1;
            let env = EventEnvelope::new(
                Uuid::now_v7(),
                feed.bill_id.0,
                bistro_billing::AGGREGATE_TYPE,
                feed.seq,
                at,
                BillEvent::BillOpened(BillOpened {
                    bill_id: feed.bill_id,
                    table_number: 5,
                    waiter: waiter.to_string(),
                }),
            );
            p.handle(&env).unwrap();
        }

        for _ in 0..8 {
            assert_eq!(p.bill_id_for_table(5), Some(early.bill_id));
        }
        assert_eq!(p.bill_for_table(5).unwrap().waiter, "Ada");
        assert_eq!(p.invoice_for_table(5).unwrap().bill_id, early.bill_id);
        assert_eq!(p.active_table_numbers(), vec![5]);

        let closed = early.next(BillEvent::BillClosed(BillClosed {
            bill_id: early.bill_id,
            amount_paid: Money::ZERO,
            order_value: Money::ZERO,
            tip_value: Money::ZERO,
        }));
        p.handle(&closed).unwrap();
        assert_eq!(p.bill_id_for_table(5), Some(late.bill_id));
    }

    #[test]
    fn items_move_through_buckets() {
        let p = OpenBills::new();
        let mut feed = Feed::new();
        let bill_id = feed.bill_id;
        opened(&p, &mut feed, 3, "Ada");

        let drink = item(1, "Lemonade", true, Money::new(dec!(5.00)));
        let food = item(2, "Risotto", false, Money::new(dec!(8.00)));
        for event in [
            BillEvent::DrinksOrdered(DrinksOrdered {
                bill_id,
                items: vec![drink.clone()],
            }),
            BillEvent::FoodOrdered(FoodOrdered {
                bill_id,
                items: vec![food.clone()],
            }),
        ] {
            p.handle(&feed.next(event)).unwrap();
        }

        let overview = p.bill_for_table(3).unwrap();
        assert_eq!(overview.to_serve, vec![BillItem::from(&drink)]);
        assert_eq!(overview.in_preparation, vec![BillItem::from(&food)]);
        assert!(overview.served.is_empty());

        for event in [
            BillEvent::FoodPrepared(FoodPrepared {
                bill_id,
                menu_numbers: vec![2],
            }),
            BillEvent::DrinksServed(DrinksServed {
                bill_id,
                menu_numbers: vec![1],
            }),
        ] {
            p.handle(&feed.next(event)).unwrap();
        }

        assert_eq!(
            p.todo_list_for_waiter("Ada"),
            BTreeMap::from([(3, vec![BillItem::from(&food)])])
        );
        let invoice = p.invoice_for_table(3).unwrap();
        assert_eq!(invoice.total, Money::new(dec!(5.00)));
        assert!(invoice.has_unserved_items);

        p.handle(&feed.next(BillEvent::FoodServed(FoodServed {
            bill_id,
            menu_numbers: vec![2],
        })))
        .unwrap();

        let invoice = p.invoice_for_table(3).unwrap();
        assert_eq!(invoice.total, Money::new(dec!(13.00)));
        assert!(!invoice.has_unserved_items);
        assert!(p.todo_list_for_waiter("Ada").is_empty());
    }

    #[test]
    fn closed_bills_leave_the_table_list() {
        let p = OpenBills::new();
        let mut first = Feed::new();
        let mut second = Feed::new();
        opened(&p, &mut first, 7, "Ada");
        opened(&p, &mut second, 2, "Grace");

        assert_eq!(p.active_table_numbers(), vec![2, 7]);
        assert_eq!(p.bill_id_for_table(7), Some(first.bill_id));

        let closed = first.next(BillEvent::BillClosed(BillClosed {
            bill_id: first.bill_id,
            amount_paid: Money::ZERO,
            order_value: Money::ZERO,
            tip_value: Money::ZERO,
        }));
        p.handle(&closed).unwrap();

        assert_eq!(p.active_table_numbers(), vec![2]);
        assert_eq!(p.bill_for_table(7), None);
        assert_eq!(p.invoice_for_table(7), None);
    }

    #[test]
    fn waiter_list_only_covers_their_tables() {
        let p = OpenBills::new();
        let mut ada = Feed::new();
        let mut grace = Feed::new();
        opened(&p, &mut ada, 1, "Ada");
        opened(&p, &mut grace, 2, "Grace");

        for feed in [&mut ada, &mut grace] {
            let bill_id = feed.bill_id;
            let env = feed.next(BillEvent::DrinksOrdered(DrinksOrdered {
                bill_id,
                items: vec![item(10, "Water", true, Money::from_cents(150))],
            }));
            p.handle(&env).unwrap();
        }

        let todo = p.todo_list_for_waiter("Ada");
        assert_eq!(todo.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn unknown_bill_or_item_is_a_logic_error() {
        let p = OpenBills::new();
        let mut feed = Feed::new();
        let bill_id = feed.bill_id;

        let err = p
            .handle(&feed.next(BillEvent::DrinksServed(DrinksServed {
                bill_id,
                menu_numbers: vec![1],
            })))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::UnknownInstance { .. }));

        opened(&p, &mut feed, 4, "Ada");
        p.handle(&feed.next(BillEvent::DrinksOrdered(DrinksOrdered {
            bill_id,
            items: vec![item(1, "Tea", true, Money::from_cents(250))],
        })))
        .unwrap();

        // #9 is missing, so #1 must stay put too.
        let err = p
            .handle(&feed.next(BillEvent::DrinksServed(DrinksServed {
                bill_id,
                menu_numbers: vec![1, 9],
            })))
            .unwrap_err();
        assert!(matches!(err, ProjectionError::UnknownItem { .. }));
        let overview = p.bill_for_table(4).unwrap();
        assert_eq!(overview.to_serve.len(), 1);
        assert!(overview.served.is_empty());
    }
}
