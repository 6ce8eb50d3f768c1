use async_trait::async_trait;
use serde_json::json;

use super::{definition, reason};
use crate::contract::{ActionRequest, Contract, ContractDraft};
use crate::dispatch::{nullable_string, ActionContext, ActionHandler};
use crate::error::{ReactorError, Result};
use crate::patch::PatchOperation;
use crate::pipeline::WriteOptions;

/// Apply `arguments.patch` to the input contract.
///
/// An empty patch still re-evaluates the contract's formulas.
pub struct UpdateCard;

#[async_trait]
impl ActionHandler for UpdateCard {
    fn name(&self) -> &'static str {
        "action-update-card"
    }

    fn definition(&self) -> ContractDraft {
        definition(
            self.name(),
            "Update properties of a card",
            json!({ "type": "object" }),
            json!({
                "reason": nullable_string(),
                "patch": { "type": "array" }
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
        let patch: Vec<PatchOperation> = request
            .arguments
            .get("patch")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| ReactorError::InvalidArguments {
                action: self.name().to_string(),
                arguments: request.arguments.clone(),
            })?
            .unwrap_or_default();

        let worker = ctx.worker();
        let type_contract = worker.type_contract(&input.type_).await?;
        let options = WriteOptions {
            attach_events: true,
            timestamp: Some(request.timestamp),
            reason: reason(request),
            actor: Some(request.actor),
            originator: request.originator,
            ..Default::default()
        };
        worker
            .patch(ctx.context(), session, &type_contract, options, &input, patch)
            .await
    }
}
