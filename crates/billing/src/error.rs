use thiserror::Error;

use crate::bill::{BillId, BillStatus};
use crate::money::Money;

/// Reasons a bill command is rejected.
///
/// Every variant is raised by `Bill::handle` before any event exists, so a
/// rejected command never changes the bill or any read model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BillError {
    #[error("bill is not open (status: {status:?})")]
    PreconditionNotOpen { status: BillStatus },

    #[error("bill has already been opened")]
    AlreadyOpened,

    #[error("items not outstanding: {missing:?}")]
    ItemsNotOutstanding { missing: Vec<u32> },

    #[error("items not prepared: {missing:?}")]
    ItemsNotPrepared { missing: Vec<u32> },

    #[error("bill still has {outstanding} outstanding and {prepared} prepared items")]
    UnservedItemsRemain { outstanding: usize, prepared: usize },

    #[error("payment of {paid} does not cover {owed}")]
    InsufficientPayment { paid: Money, owed: Money },

    #[error("bill amount would exceed the representable range")]
    AmountOverflow,

    #[error("command for bill {found} routed to bill {expected}")]
    WrongBill { expected: BillId, found: BillId },
}
