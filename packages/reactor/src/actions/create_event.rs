use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::definition;
use crate::contract::{types, ActionRequest, Contract, ContractDraft};
use crate::dispatch::{nullable_string, ActionContext, ActionHandler};
use crate::error::{ReactorError, Result};
use crate::pipeline::WriteOptions;

/// Record a timeline event on the input contract and link it there.
///
/// The event copies the contract's markers so both share visibility.
pub struct CreateEvent;

#[async_trait]
impl ActionHandler for CreateEvent {
    fn name(&self) -> &'static str {
        "action-create-event"
    }

    fn definition(&self) -> ContractDraft {
        definition(
            self.name(),
            "Attach an event to a card",
            json!({ "type": "object" }),
            json!({
                "name": nullable_string(),
                "type": { "type": "string", "pattern": "^[a-z0-9-]+$" },
                "payload": { "type": ["object", "array"] },
                "tags": { "type": "array", "items": { "type": "string" } }
            }),
        )
    }

    async fn handle(
        &self,
        session: &str,
        ctx: &ActionContext,
        card: Contract,
        request: &ActionRequest,
    ) -> Result<Option<Contract>> {
        let arguments = &request.arguments;
        let event_type = arguments
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ReactorError::InvalidArguments {
                action: self.name().to_string(),
                arguments: arguments.clone(),
            })?;
        let tags: Vec<String> = arguments
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let worker = ctx.worker();
        let event_contract_type = worker.type_contract(&format!("{}@1.0.0", event_type)).await?;
        let link_type = worker.type_contract(types::LINK).await?;

        let options = WriteOptions {
            timestamp: Some(request.timestamp),
            actor: Some(request.actor),
            originator: request.originator,
            ..Default::default()
        };

        let mut event = ContractDraft::new(format!("{}-{}", event_type, Uuid::new_v4()))
            .with_version("1.0.0")
            .with_markers(card.markers.clone())
            .with_data(json!({
                "timestamp": request.timestamp.to_rfc3339(),
                "target": card.id,
                "actor": request.actor,
                "payload": arguments.get("payload").cloned().unwrap_or(Value::Null),
            }));
        event.tags = Some(tags);
        if let Some(name) = arguments.get("name").and_then(Value::as_str) {
            event.name = Some(name.to_string());
        }

        let event = worker
            .insert(ctx.context(), session, &event_contract_type, options.clone(), event)
            .await?
            .ok_or(ReactorError::NoExecuteEvent(request.id))?;

        let link = ContractDraft::new(format!("link-{}-is-attached-to-{}", event.id, card.id))
            .with_version("1.0.0")
            .with_name("is attached to")
            .with_data(json!({
                "inverseName": "has attached element",
                "from": { "id": event.id, "type": event.type_ },
                "to": { "id": card.id, "type": card.type_ },
            }));
        worker
            .insert(ctx.context(), session, &link_type, options, link)
            .await?;

        Ok(Some(event))
    }
}
