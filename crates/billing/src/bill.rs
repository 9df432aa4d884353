use serde::{Deserialize, Serialize};

use bistro_core::{Aggregate, AggregateId, AggregateRoot};
use bistro_events::{Command, Event};

use crate::error::BillError;
use crate::money::Money;

/// Aggregate type recorded on every bill stream.
pub const AGGREGATE_TYPE: &str = "restaurant.bill";

/// Stable event type names, used for projection subscriptions.
pub mod event_types {
    pub const BILL_OPENED: &str = "restaurant.bill.opened";
    pub const DRINKS_ORDERED: &str = "restaurant.bill.drinks_ordered";
    pub const FOOD_ORDERED: &str = "restaurant.bill.food_ordered";
    pub const DRINKS_SERVED: &str = "restaurant.bill.drinks_served";
    pub const FOOD_PREPARED: &str = "restaurant.bill.food_prepared";
    pub const FOOD_SERVED: &str = "restaurant.bill.food_served";
    pub const BILL_CLOSED: &str = "restaurant.bill.closed";
}

/// Bill identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillId(pub AggregateId);

impl BillId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for BillId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Bill lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    Unopened,
    Open,
    Closed,
}

/// A line on an order, as taken by the waiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedItem {
    pub menu_number: u32,
    pub description: String,
    pub is_drink: bool,
    pub price: Money,
}

/// Aggregate root: Bill.
///
/// Items move outstanding → (prepared →) served. Drinks skip preparation.
/// Once served, an item leaves the aggregate and only its price remains, in
/// `served_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bill {
    id: BillId,
    status: BillStatus,
    table_number: Option<u32>,
    waiter: Option<String>,
    served_value: Money,
    outstanding_drinks: Vec<OrderedItem>,
    outstanding_food: Vec<OrderedItem>,
    prepared_food: Vec<OrderedItem>,
    version: u64,
}

impl Bill {
    /// Create an empty, not-yet-opened instance for rehydration.
    pub fn empty(id: BillId) -> Self {
        Self {
            id,
            status: BillStatus::Unopened,
            table_number: None,
            waiter: None,
            served_value: Money::ZERO,
            outstanding_drinks: Vec::new(),
            outstanding_food: Vec::new(),
            prepared_food: Vec::new(),
            version: 0,
        }
    }

    pub fn status(&self) -> BillStatus {
        self.status
    }

    pub fn table_number(&self) -> Option<u32> {
        self.table_number
    }

    pub fn waiter(&self) -> Option<&str> {
        self.waiter.as_deref()
    }

    pub fn served_value(&self) -> Money {
        self.served_value
    }

    pub fn outstanding_drinks(&self) -> &[OrderedItem] {
        &self.outstanding_drinks
    }

    pub fn outstanding_food(&self) -> &[OrderedItem] {
        &self.outstanding_food
    }

    pub fn prepared_food(&self) -> &[OrderedItem] {
        &self.prepared_food
    }

    pub fn has_unserved_items(&self) -> bool {
        !self.outstanding_drinks.is_empty()
            || !self.outstanding_food.is_empty()
            || !self.prepared_food.is_empty()
    }
}

impl AggregateRoot for Bill {
    type Id = BillId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenBill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBill {
    pub bill_id: BillId,
    pub table_number: u32,
    pub waiter: String,
}

/// Command: PlaceOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub bill_id: BillId,
    pub items: Vec<OrderedItem>,
}

/// Command: MarkDrinksServed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkDrinksServed {
    pub bill_id: BillId,
    pub menu_numbers: Vec<u32>,
}

/// Command: MarkFoodPrepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkFoodPrepared {
    pub bill_id: BillId,
    pub menu_numbers: Vec<u32>,
}

/// Command: MarkFoodServed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkFoodServed {
    pub bill_id: BillId,
    pub menu_numbers: Vec<u32>,
}

/// Command: CloseBill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseBill {
    pub bill_id: BillId,
    pub amount_paid: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillCommand {
    OpenBill(OpenBill),
    PlaceOrder(PlaceOrder),
    MarkDrinksServed(MarkDrinksServed),
    MarkFoodPrepared(MarkFoodPrepared),
    MarkFoodServed(MarkFoodServed),
    CloseBill(CloseBill),
}

impl BillCommand {
    pub fn bill_id(&self) -> BillId {
        match self {
            BillCommand::OpenBill(c) => c.bill_id,
            BillCommand::PlaceOrder(c) => c.bill_id,
            BillCommand::MarkDrinksServed(c) => c.bill_id,
            BillCommand::MarkFoodPrepared(c) => c.bill_id,
            BillCommand::MarkFoodServed(c) => c.bill_id,
            BillCommand::CloseBill(c) => c.bill_id,
        }
    }
}

impl Command for BillCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.bill_id().0
    }
}

/// Event: BillOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillOpened {
    pub bill_id: BillId,
    pub table_number: u32,
    pub waiter: String,
}

/// Event: DrinksOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrinksOrdered {
    pub bill_id: BillId,
    pub items: Vec<OrderedItem>,
}

/// Event: FoodOrdered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodOrdered {
    pub bill_id: BillId,
    pub items: Vec<OrderedItem>,
}

/// Event: DrinksServed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrinksServed {
    pub bill_id: BillId,
    pub menu_numbers: Vec<u32>,
}

/// Event: FoodPrepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodPrepared {
    pub bill_id: BillId,
    pub menu_numbers: Vec<u32>,
}

/// Event: FoodServed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodServed {
    pub bill_id: BillId,
    pub menu_numbers: Vec<u32>,
}

/// Event: BillClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillClosed {
    pub bill_id: BillId,
    pub amount_paid: Money,
    pub order_value: Money,
    pub tip_value: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillEvent {
    BillOpened(BillOpened),
    DrinksOrdered(DrinksOrdered),
    FoodOrdered(FoodOrdered),
    DrinksServed(DrinksServed),
    FoodPrepared(FoodPrepared),
    FoodServed(FoodServed),
    BillClosed(BillClosed),
}

impl BillEvent {
    pub fn bill_id(&self) -> BillId {
        match self {
            BillEvent::BillOpened(e) => e.bill_id,
            BillEvent::DrinksOrdered(e) => e.bill_id,
            BillEvent::FoodOrdered(e) => e.bill_id,
            BillEvent::DrinksServed(e) => e.bill_id,
            BillEvent::FoodPrepared(e) => e.bill_id,
            BillEvent::FoodServed(e) => e.bill_id,
            BillEvent::BillClosed(e) => e.bill_id,
        }
    }
}

impl Event for BillEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BillEvent::BillOpened(_) => event_types::BILL_OPENED,
            BillEvent::DrinksOrdered(_) => event_types::DRINKS_ORDERED,
            BillEvent::FoodOrdered(_) => event_types::FOOD_ORDERED,
            BillEvent::DrinksServed(_) => event_types::DRINKS_SERVED,
            BillEvent::FoodPrepared(_) => event_types::FOOD_PREPARED,
            BillEvent::FoodServed(_) => event_types::FOOD_SERVED,
            BillEvent::BillClosed(_) => event_types::BILL_CLOSED,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn aggregate_id(&self) -> AggregateId {
        self.bill_id().0
    }
}

impl Aggregate for Bill {
    type Command = BillCommand;
    type Event = BillEvent;
    type Error = BillError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BillEvent::BillOpened(e) => {
                self.status = BillStatus::Open;
                self.table_number = Some(e.table_number);
                self.waiter = Some(e.waiter.clone());
            }
            BillEvent::DrinksOrdered(e) => {
                self.outstanding_drinks.extend(e.items.iter().cloned());
            }
            BillEvent::FoodOrdered(e) => {
                self.outstanding_food.extend(e.items.iter().cloned());
            }
            // `handle` checked that the new served value fits.
            BillEvent::DrinksServed(e) => {
                for item in take_items(&mut self.outstanding_drinks, &e.menu_numbers) {
                    self.served_value += item.price;
                }
            }
            BillEvent::FoodPrepared(e) => {
                let prepared = take_items(&mut self.outstanding_food, &e.menu_numbers);
                self.prepared_food.extend(prepared);
            }
            BillEvent::FoodServed(e) => {
                for item in take_items(&mut self.prepared_food, &e.menu_numbers) {
                    self.served_value += item.price;
                }
            }
            BillEvent::BillClosed(_) => {
                self.status = BillStatus::Closed;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        self.ensure_bill_id(command.bill_id())?;
        match command {
            BillCommand::OpenBill(cmd) => self.handle_open(cmd),
            BillCommand::PlaceOrder(cmd) => self.handle_place_order(cmd),
            BillCommand::MarkDrinksServed(cmd) => self.handle_drinks_served(cmd),
            BillCommand::MarkFoodPrepared(cmd) => self.handle_food_prepared(cmd),
            BillCommand::MarkFoodServed(cmd) => self.handle_food_served(cmd),
            BillCommand::CloseBill(cmd) => self.handle_close(cmd),
        }
    }

    fn is_terminal(&self) -> bool {
        self.status == BillStatus::Closed
    }
}

impl Bill {
    fn ensure_bill_id(&self, bill_id: BillId) -> Result<(), BillError> {
        if self.id != bill_id {
            return Err(BillError::WrongBill {
                expected: self.id,
                found: bill_id,
            });
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), BillError> {
        if self.status != BillStatus::Open {
            return Err(BillError::PreconditionNotOpen {
                status: self.status,
            });
        }
        Ok(())
    }

    fn handle_open(&self, cmd: &OpenBill) -> Result<Vec<BillEvent>, BillError> {
        if self.status != BillStatus::Unopened {
            return Err(BillError::AlreadyOpened);
        }

        Ok(vec![BillEvent::BillOpened(BillOpened {
            bill_id: cmd.bill_id,
            table_number: cmd.table_number,
            waiter: cmd.waiter.clone(),
        })])
    }

    fn handle_place_order(&self, cmd: &PlaceOrder) -> Result<Vec<BillEvent>, BillError> {
        self.ensure_open()?;
        // Everything on the bill must stay payable once served.
        add_prices(
            self.served_value,
            self.outstanding_drinks
                .iter()
                .chain(&self.outstanding_food)
                .chain(&self.prepared_food)
                .chain(&cmd.items),
        )?;

        let (drinks, food): (Vec<OrderedItem>, Vec<OrderedItem>) =
            cmd.items.iter().cloned().partition(|item| item.is_drink);

        let mut events = Vec::with_capacity(2);
        if !drinks.is_empty() {
            events.push(BillEvent::DrinksOrdered(DrinksOrdered {
                bill_id: cmd.bill_id,
                items: drinks,
            }));
        }
        if !food.is_empty() {
            events.push(BillEvent::FoodOrdered(FoodOrdered {
                bill_id: cmd.bill_id,
                items: food,
            }));
        }
        Ok(events)
    }

    fn handle_drinks_served(&self, cmd: &MarkDrinksServed) -> Result<Vec<BillEvent>, BillError> {
        self.ensure_open()?;
        if cmd.menu_numbers.is_empty() {
            return Ok(vec![]);
        }

        let missing = missing_items(&cmd.menu_numbers, &self.outstanding_drinks);
        if !missing.is_empty() {
            return Err(BillError::ItemsNotOutstanding { missing });
        }
        self.served_value_after(&self.outstanding_drinks, &cmd.menu_numbers)?;

        Ok(vec![BillEvent::DrinksServed(DrinksServed {
            bill_id: cmd.bill_id,
            menu_numbers: cmd.menu_numbers.clone(),
        })])
    }

    fn handle_food_prepared(&self, cmd: &MarkFoodPrepared) -> Result<Vec<BillEvent>, BillError> {
        self.ensure_open()?;
        if cmd.menu_numbers.is_empty() {
            return Ok(vec![]);
        }

        let missing = missing_items(&cmd.menu_numbers, &self.outstanding_food);
        if !missing.is_empty() {
            return Err(BillError::ItemsNotOutstanding { missing });
        }

        Ok(vec![BillEvent::FoodPrepared(FoodPrepared {
            bill_id: cmd.bill_id,
            menu_numbers: cmd.menu_numbers.clone(),
        })])
    }

    fn handle_food_served(&self, cmd: &MarkFoodServed) -> Result<Vec<BillEvent>, BillError> {
        self.ensure_open()?;
        if cmd.menu_numbers.is_empty() {
            return Ok(vec![]);
        }

        let missing = missing_items(&cmd.menu_numbers, &self.prepared_food);
        if !missing.is_empty() {
            return Err(BillError::ItemsNotPrepared { missing });
        }
        self.served_value_after(&self.prepared_food, &cmd.menu_numbers)?;

        Ok(vec![BillEvent::FoodServed(FoodServed {
            bill_id: cmd.bill_id,
            menu_numbers: cmd.menu_numbers.clone(),
        })])
    }

    fn handle_close(&self, cmd: &CloseBill) -> Result<Vec<BillEvent>, BillError> {
        self.ensure_open()?;

        if self.has_unserved_items() {
            return Err(BillError::UnservedItemsRemain {
                outstanding: self.outstanding_drinks.len() + self.outstanding_food.len(),
                prepared: self.prepared_food.len(),
            });
        }

        if cmd.amount_paid < self.served_value {
            return Err(BillError::InsufficientPayment {
                paid: cmd.amount_paid,
                owed: self.served_value,
            });
        }

        let tip_value = cmd
            .amount_paid
            .checked_sub(self.served_value)
            .ok_or(BillError::AmountOverflow)?;

        Ok(vec![BillEvent::BillClosed(BillClosed {
            bill_id: cmd.bill_id,
            amount_paid: cmd.amount_paid,
            order_value: self.served_value,
            tip_value,
        })])
    }

    /// Served value once `menu_numbers` are taken from `from` and served.
    fn served_value_after(
        &self,
        from: &[OrderedItem],
        menu_numbers: &[u32],
    ) -> Result<Money, BillError> {
        let mut remaining = from.to_vec();
        add_prices(self.served_value, &take_items(&mut remaining, menu_numbers))
    }
}

fn add_prices<'a>(
    start: Money,
    items: impl IntoIterator<Item = &'a OrderedItem>,
) -> Result<Money, BillError> {
    items.into_iter().try_fold(start, |total, item| {
        total.checked_add(item.price).ok_or(BillError::AmountOverflow)
    })
}

/// Menu numbers in `want` that `have` cannot cover, treating both as multisets.
fn missing_items(want: &[u32], have: &[OrderedItem]) -> Vec<u32> {
    let mut available: Vec<u32> = have.iter().map(|item| item.menu_number).collect();
    let mut missing = Vec::new();
    for num in want {
        match available.iter().position(|n| n == num) {
            Some(pos) => {
                available.swap_remove(pos);
            }
            None => missing.push(*num),
        }
    }
    missing
}

/// Remove the first matching item for each menu number, in request order.
///
/// Events only reach `apply` after `handle` checked every number is present.
fn take_items(from: &mut Vec<OrderedItem>, menu_numbers: &[u32]) -> Vec<OrderedItem> {
    let mut taken = Vec::with_capacity(menu_numbers.len());
    for num in menu_numbers {
        if let Some(pos) = from.iter().position(|item| item.menu_number == *num) {
            taken.push(from.remove(pos));
        }
    }
    taken
}
