//! Restaurant bill domain module (event-sourced).
//!
//! Business rules for a bill, implemented purely as deterministic domain logic
//! (no IO, no locking, no storage).

pub mod bill;
pub mod error;
pub mod money;

pub use bill::{
    AGGREGATE_TYPE, Bill, BillClosed, BillCommand, BillEvent, BillId, BillOpened, BillStatus,
    CloseBill, DrinksOrdered, DrinksServed, FoodOrdered, FoodPrepared, FoodServed,
    MarkDrinksServed, MarkFoodPrepared, MarkFoodServed, OpenBill, OrderedItem, PlaceOrder,
    event_types,
};
pub use error::BillError;
pub use money::Money;
