//! Built-in actions.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::contract::{types, ContractDraft};
use crate::dispatch::ActionHandler;

mod create_card;
mod create_event;
mod update_card;

pub use create_card::CreateCard;
pub use create_event::CreateEvent;
pub use update_card::UpdateCard;

pub const CREATE_CARD: &str = "action-create-card@1.0.0";
pub const UPDATE_CARD: &str = "action-update-card@1.0.0";
pub const CREATE_EVENT: &str = "action-create-event@1.0.0";

pub fn builtin() -> Vec<Arc<dyn ActionHandler>> {
    vec![Arc::new(CreateCard), Arc::new(UpdateCard), Arc::new(CreateEvent)]
}

fn definition(slug: &str, name: &str, filter: Value, arguments: Value) -> ContractDraft {
    ContractDraft::new(slug)
        .with_type(types::ACTION)
        .with_version("1.0.0")
        .with_name(name)
        .with_markers(Vec::new())
        .with_data(json!({
            "filter": filter,
            "arguments": arguments,
        }))
}

fn reason(request: &crate::contract::ActionRequest) -> Option<String> {
    request
        .arguments
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
}
