use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{definition, reason};
use crate::contract::{types, ActionRequest, Contract, ContractDraft};
use crate::dispatch::{nullable_string, ActionContext, ActionHandler};
use crate::error::{ReactorError, Result};
use crate::pipeline::WriteOptions;

/// Insert a contract of the input type from `arguments.properties`.
pub struct CreateCard;

#[async_trait]
impl ActionHandler for CreateCard {
    fn name(&self) -> &'static str {
        "action-create-card"
    }

    fn definition(&self) -> ContractDraft {
        definition(
            self.name(),
            "Create a new card",
            json!({
                "type": "object",
                "required": ["type"],
                "properties": { "type": { "type": "string", "const": types::TYPE } }
            }),
            json!({
                "reason": nullable_string(),
                "properties": { "type": "object" }
            }),
        )
    }

    async fn handle(
        &self,
        session: &str,
        ctx: &ActionContext,
        input: Contract,
        request: &ActionRequest,
    ) -> Result<Option<Contract>> {
        let properties = request
            .arguments
            .get("properties")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let mut draft = ContractDraft::from_json(properties).map_err(|_| ReactorError::InvalidArguments {
            action: self.name().to_string(),
            arguments: request.arguments.clone(),
        })?;
        if draft.data.is_null() {
            draft.data = Value::Object(Default::default());
        }
        if draft.slug.is_none() {
            draft.slug = Some(format!("{}-{}", input.slug, Uuid::new_v4()));
        }

        let options = WriteOptions {
            attach_events: true,
            timestamp: Some(request.timestamp),
            reason: reason(request),
            actor: Some(request.actor),
            originator: request.originator,
            ..Default::default()
        };
        ctx.worker()
            .insert(ctx.context(), session, &input, options, draft)
            .await
    }
}
