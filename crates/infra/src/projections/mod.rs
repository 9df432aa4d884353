//! Projection implementations (read model builders).
//!
//! Projections consume bill events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: can be reconstructed from the event store
//! - **Concurrent**: queries run while events are being folded
//! - **Copy-out**: queries return owned snapshots

pub mod chef_todo_list;
pub mod open_bills;
pub mod replay;

pub use chef_todo_list::{CHEF_TODO_LIST, ChefTodoList, TodoListGroup, TodoListItem};
pub use open_bills::{BillInvoice, BillItem, BillOverview, OPEN_BILLS, OpenBills};
pub use replay::{ReplayError, ReplaySummary, rebuild_projection};
