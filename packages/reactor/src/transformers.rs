//! Transformer evaluation.
//!
//! A transformer turns a contract that starts matching its `inputFilter` into
//! a pending `task@1.0.0` and links the task back to the transformer. Both
//! writes run as the transformer's owner and are awaited through the queue.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::contract::{types, ActionRequest, ActionResult, Contract, LogContext};
use crate::error::{ReactorError, Result};
use crate::schema;
use crate::traits::store::QueryOptions;

const CREATE_CARD: &str = "action-create-card@1.0.0";

/// What transformer evaluation needs from the worker.
#[async_trait]
pub trait TransformerHost: Send + Sync {
    async fn query(&self, schema: &Value, options: QueryOptions) -> Result<Vec<Contract>>;

    /// Enqueue a request and wait for its result.
    async fn execute_and_await(&self, request: ActionRequest) -> Result<ActionResult>;
}

fn artifact_ready(contract: &Contract) -> Option<&Value> {
    contract.data_at(&["$transformer", "artifactReady"])
}

/// Run every transformer whose input filter `current` newly satisfies.
///
/// Returns how many transformers produced a task.
pub async fn evaluate(
    host: &dyn TransformerHost,
    transformers: &[Contract],
    previous: Option<&Contract>,
    current: &Contract,
    context: &LogContext,
) -> Result<usize> {
    let ready_now = artifact_ready(current);
    if ready_now == Some(&Value::Bool(false)) {
        return Ok(0);
    }
    let ready_changed = previous.and_then(artifact_ready) != ready_now;

    let current_json = current.to_json();
    let previous_json = previous.map(Contract::to_json).unwrap_or_else(|| json!({}));

    let runs = transformers.iter().filter_map(|transformer| {
        let filter = transformer.data.get("inputFilter").filter(|f| !f.is_null())?;
        let matches_now = schema::matches(filter, &current_json);
        let matched_previously = schema::matches(filter, &previous_json);
        (matches_now && (!matched_previously || ready_changed))
            .then(|| run_transformer(host, transformer, current, context))
    });

    let mut ran = 0;
    let mut first_error = None;
    for outcome in join_all(runs).await {
        match outcome {
            Ok(true) => ran += 1,
            Ok(false) => {}
            Err(e) if first_error.is_none() => first_error = Some(e),
            Err(e) => error!(context = %context, error = %e, "transformer failed"),
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(ran),
    }
}

async fn run_transformer(
    host: &dyn TransformerHost,
    transformer: &Contract,
    current: &Contract,
    context: &LogContext,
) -> Result<bool> {
    let Some(owner) = transformer_owner(host, transformer).await? else {
        warn!(
            context = %context,
            transformer_id = %transformer.id,
            transformer_slug = %transformer.slug,
            "cannot run transformer that does not have an owner"
        );
        return Ok(false);
    };

    let name = format!(
        "Transform {} using transformer {}",
        current.name.as_deref().unwrap_or("undefined"),
        transformer.name.as_deref().unwrap_or("undefined"),
    );
    let task = ActionRequest::new(
        CREATE_CARD,
        owner.id,
        types::TASK,
        json!({
            "reason": null,
            "properties": {
                "name": name,
                "data": {
                    "status": "pending",
                    "input": current.to_json(),
                    "transformer": transformer.to_json(),
                    "actor": owner.id,
                    "workerFilter": {
                        "schema": transformer.data.get("workerFilter").cloned().unwrap_or(Value::Null)
                    }
                }
            }
        }),
        context.clone(),
    )
    .with_input_type("type");

    let result = host.execute_and_await(task).await?;
    if result.error {
        return Err(ReactorError::ActionFailed {
            action: CREATE_CARD.into(),
            data: result.data,
        });
    }
    let task_id = result.data.get("id").cloned().unwrap_or(Value::Null);
    let task_type = result.data.get("type").cloned().unwrap_or(Value::Null);
    let task_ref = task_id.as_str().unwrap_or_default().to_string();

    debug!(
        context = %context,
        transformer = %transformer.slug,
        task = %task_ref,
        "created transformer task"
    );

    let link = ActionRequest::new(
        CREATE_CARD,
        owner.id,
        types::LINK,
        json!({
            "reason": null,
            "properties": {
                "slug": format!("link-{}-generated-{}-{}", transformer.id, task_ref, Uuid::new_v4()),
                "name": "generated",
                "data": {
                    "inverseName": "was generated by",
                    "from": { "id": transformer.id, "type": transformer.type_ },
                    "to": { "id": task_id, "type": task_type }
                }
            }
        }),
        context.clone(),
    )
    .with_input_type("type");

    let result = host.execute_and_await(link).await?;
    if result.error {
        return Err(ReactorError::ActionFailed {
            action: CREATE_CARD.into(),
            data: result.data,
        });
    }
    Ok(true)
}

/// The actor owning the transformer, or else the owner of its repository.
async fn transformer_owner(host: &dyn TransformerHost, transformer: &Contract) -> Result<Option<Contract>> {
    let direct = json!({
        "type": "object",
        "properties": { "active": { "const": true } },
        "$$links": {
            "owns": {
                "type": "object",
                "properties": { "id": { "const": transformer.id } }
            }
        }
    });
    if let Some(owner) = host.query(&direct, QueryOptions::limit(1)).await?.into_iter().next() {
        return Ok(Some(owner));
    }

    let by_repository = json!({
        "type": "object",
        "properties": { "active": { "const": true } },
        "$$links": {
            "owns": {
                "type": "object",
                "required": ["type", "data"],
                "properties": {
                    "type": { "const": types::CONTRACT_REPOSITORY },
                    "active": { "const": true },
                    "data": {
                        "type": "object",
                        "required": ["base_slug"],
                        "properties": { "base_slug": { "const": transformer.slug } }
                    }
                }
            }
        }
    });
    Ok(host
        .query(&by_repository, QueryOptions::limit(1))
        .await?
        .into_iter()
        .next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records requests and answers owner queries from a fixed list.
    struct StubHost {
        owner: Option<Contract>,
        requests: Mutex<Vec<ActionRequest>>,
    }

    impl StubHost {
        fn new(owner: Option<Contract>) -> Self {
            Self {
                owner,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<ActionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransformerHost for StubHost {
        async fn query(&self, _schema: &Value, _options: QueryOptions) -> Result<Vec<Contract>> {
            Ok(self.owner.clone().into_iter().collect())
        }

        async fn execute_and_await(&self, request: ActionRequest) -> Result<ActionResult> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(ActionResult::success(json!({
                "id": Uuid::new_v4(),
                "type": request.input,
                "slug": "generated",
            })))
        }
    }

    fn contract(slug: &str, type_: &str, data: Value) -> Contract {
        Contract::from_json(json!({
            "id": Uuid::new_v4(),
            "slug": slug,
            "name": slug,
            "type": type_,
            "data": data,
            "created_at": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    fn transformer() -> Contract {
        contract(
            "transformer-build",
            types::TRANSFORMER,
            json!({
                "inputFilter": {
                    "type": "object",
                    "required": ["data"],
                    "properties": {
                        "data": { "type": "object", "required": ["ready"] }
                    }
                },
                "workerFilter": { "type": "object" }
            }),
        )
    }

    fn owner() -> Contract {
        contract("user-owner", types::USER, json!({}))
    }

    #[tokio::test]
    async fn runs_when_filter_starts_matching() {
        let host = StubHost::new(Some(owner()));
        let ctx = LogContext::new("test");
        let before = contract("artifact", types::CARD, json!({}));
        let after = contract("artifact", types::CARD, json!({ "ready": true }));

        let ran = evaluate(&host, &[transformer()], Some(&before), &after, &ctx)
            .await
            .unwrap();
        assert_eq!(ran, 1);

        let requests = host.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].input, types::TASK);
        assert_eq!(requests[0].actor, host.owner.as_ref().unwrap().id);
        assert_eq!(requests[0].arguments["properties"]["data"]["status"], "pending");
        assert_eq!(requests[1].input, types::LINK);
        assert_eq!(requests[1].arguments["properties"]["name"], "generated");
    }

    #[tokio::test]
    async fn does_not_rerun_while_filter_keeps_matching() {
        let host = StubHost::new(Some(owner()));
        let ctx = LogContext::new("test");
        let before = contract("artifact", types::CARD, json!({ "ready": true }));
        let after = contract("artifact", types::CARD, json!({ "ready": true, "more": 1 }));

        let ran = evaluate(&host, &[transformer()], Some(&before), &after, &ctx)
            .await
            .unwrap();
        assert_eq!(ran, 0);
        assert!(host.requests().is_empty());
    }

    #[tokio::test]
    async fn artifact_readiness_gates_runs() {
        let host = StubHost::new(Some(owner()));
        let ctx = LogContext::new("test");
        let not_ready = contract(
            "artifact",
            types::CARD,
            json!({ "ready": true, "$transformer": { "artifactReady": false } }),
        );
        let ran = evaluate(&host, &[transformer()], None, &not_ready, &ctx)
            .await
            .unwrap();
        assert_eq!(ran, 0);

        // Readiness flipping reruns even though the filter already matched.
        let ready = contract(
            "artifact",
            types::CARD,
            json!({ "ready": true, "$transformer": { "artifactReady": true } }),
        );
        let ran = evaluate(&host, &[transformer()], Some(&not_ready), &ready, &ctx)
            .await
            .unwrap();
        assert_eq!(ran, 1);
    }

    #[tokio::test]
    async fn ownerless_transformers_are_skipped() {
        let host = StubHost::new(None);
        let ctx = LogContext::new("test");
        let after = contract("artifact", types::CARD, json!({ "ready": true }));

        let ran = evaluate(&host, &[transformer()], None, &after, &ctx)
            .await
            .unwrap();
        assert_eq!(ran, 0);
        assert!(host.requests().is_empty());
    }

    #[tokio::test]
    async fn transformers_without_input_filter_never_run() {
        let host = StubHost::new(Some(owner()));
        let ctx = LogContext::new("test");
        let bare = contract("transformer-bare", types::TRANSFORMER, json!({}));
        let after = contract("artifact", types::CARD, json!({ "ready": true }));

        let ran = evaluate(&host, &[bare], None, &after, &ctx).await.unwrap();
        assert_eq!(ran, 0);
    }
}
