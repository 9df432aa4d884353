//! Chef's to-do list: food ordered but not yet prepared, grouped by bill.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use bistro_billing::{BillEvent, BillId, event_types};
use bistro_events::{EventEnvelope, Projection, ProjectionError};

pub const CHEF_TODO_LIST: &str = "restaurant.chef_todo_list";

const SUBSCRIBED: &[&str] = &[event_types::FOOD_ORDERED, event_types::FOOD_PREPARED];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoListItem {
    pub menu_number: u32,
    pub description: String,
}

/// Outstanding food for one bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoListGroup {
    pub bill_id: BillId,
    pub items: Vec<TodoListItem>,
}

/// Groups are kept in the order their bill first ordered food. A bill
/// ordering again extends its existing group; a group disappears once all
/// of its items are prepared.
#[derive(Debug, Default)]
pub struct ChefTodoList {
    groups: Mutex<Vec<TodoListGroup>>,
}

impl ChefTodoList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current list.
    pub fn todo_list(&self) -> Vec<TodoListGroup> {
        self.groups.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl Projection<BillEvent> for ChefTodoList {
    fn name(&self) -> &'static str {
        CHEF_TODO_LIST
    }

    fn subscribed_to(&self) -> &'static [&'static str] {
        SUBSCRIBED
    }

    fn handle(&self, envelope: &EventEnvelope<BillEvent>) -> Result<(), ProjectionError> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|_| ProjectionError::Poisoned(CHEF_TODO_LIST))?;

        match envelope.payload() {
            BillEvent::FoodOrdered(e) => {
                let items = e.items.iter().map(|item| TodoListItem {
                    menu_number: item.menu_number,
                    description: item.description.clone(),
                });
                match groups.iter_mut().find(|g| g.bill_id == e.bill_id) {
                    Some(group) => group.items.extend(items),
                    None => groups.push(TodoListGroup {
                        bill_id: e.bill_id,
                        items: items.collect(),
                    }),
                }
                Ok(())
            }
            BillEvent::FoodPrepared(e) => {
                let idx = groups
                    .iter()
                    .position(|g| g.bill_id == e.bill_id)
                    .ok_or(ProjectionError::UnknownInstance {
                        projection: CHEF_TODO_LIST,
                        event_type: envelope.event_type(),
                        aggregate_id: e.bill_id.0,
                    })?;

                let mut remaining = groups[idx].items.clone();
                for &menu_number in &e.menu_numbers {
                    let pos = remaining
                        .iter()
                        .position(|item| item.menu_number == menu_number)
                        .ok_or_else(|| ProjectionError::UnknownItem {
                            projection: CHEF_TODO_LIST,
                            aggregate_id: e.bill_id.0,
                            item: format!("#{menu_number}"),
                        })?;
                    remaining.remove(pos);
                }

                if remaining.is_empty() {
                    groups.remove(idx);
                } else {
                    groups[idx].items = remaining;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
