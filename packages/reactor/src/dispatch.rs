//! Action dispatch: resolve, validate and run one action request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::contract::{base_name, ActionRequest, ActionResult, Contract, ContractDraft, ExecutionEvent, LogContext, PendingRequest};
use crate::error::{ReactorError, Result};
use crate::schema;
use crate::worker::Worker;

/// What a handler gets besides its input: the worker and the request's log context.
#[derive(Clone)]
pub struct ActionContext {
    worker: Worker,
    context: LogContext,
}

impl ActionContext {
    pub fn new(worker: Worker, context: LogContext) -> Self {
        Self { worker, context }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }

    /// Session with full access, used for internal writes.
    pub fn privileged_session(&self) -> &str {
        self.worker.session()
    }
}

/// Implementation behind an `action@1.0.0` contract.
///
/// Handlers are looked up by the action's base name; the version suffix of
/// the requested action is ignored.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Base name, e.g. `action-create-card`.
    fn name(&self) -> &'static str;

    /// The action contract stored at initialisation.
    fn definition(&self) -> ContractDraft;

    /// Rewrite arguments before the request is enqueued.
    async fn pre(
        &self,
        _session: &str,
        _ctx: &ActionContext,
        _request: &ActionRequest,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn handle(
        &self,
        session: &str,
        ctx: &ActionContext,
        input: Contract,
        request: &ActionRequest,
    ) -> Result<Option<Contract>>;
}

/// Handlers known to a worker, keyed by base name.
#[derive(Clone, Default)]
pub struct ActionLibrary {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Library with the built-in card and event actions.
    pub fn builtin() -> Self {
        let mut library = Self::new();
        for handler in crate::actions::builtin() {
            library.register(handler);
        }
        library
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Find the handler for `action-name` or `action-name@version`.
    pub fn get(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(base_name(action)).cloned()
    }

    pub fn definitions(&self) -> Vec<ContractDraft> {
        let mut definitions: Vec<ContractDraft> =
            self.handlers.values().map(|handler| handler.definition()).collect();
        definitions.sort_by(|a, b| a.slug.cmp(&b.slug));
        definitions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Schema for `arguments`, built from the action's declared arguments.
pub fn arguments_schema(action: &Contract) -> Value {
    match action.data.get("arguments").and_then(Value::as_object) {
        Some(arguments) if !arguments.is_empty() => {
            let required = action
                .data
                .get("required")
                .cloned()
                .unwrap_or_else(|| json!(arguments.keys().collect::<Vec<_>>()));
            json!({
                "type": "object",
                "additionalProperties": false,
                "properties": arguments,
                "required": required,
            })
        }
        _ => json!({ "type": "object" }),
    }
}

impl Worker {
    /// Validate `request` against `action` and run its handler.
    pub async fn dispatch(
        &self,
        session: &str,
        action: &Contract,
        request: &ActionRequest,
    ) -> Result<Option<Contract>> {
        let store = self.store();
        let (input, actor) = tokio::join!(
            store.get_by_identifier(&request.input),
            store.get_by_id(request.actor)
        );
        let input = input?.ok_or_else(|| ReactorError::NoInputContract(request.input.clone()))?;
        actor?.ok_or(ReactorError::NoActor(request.actor))?;

        let filter = action
            .data
            .get("filter")
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object" }));
        let validation = schema::validate(&filter, &input.to_json());
        if !validation.valid {
            error!(context = %request.context, action = %action.slug, filter = %filter, "contract schema mismatch");
            for violation in &validation.errors {
                error!(context = %request.context, action = %action.slug, violation = %violation, "violated subschema");
            }
            return Err(ReactorError::InputMismatch {
                action: action.slug.clone(),
                input: input.slug.clone(),
                errors: validation.errors,
            });
        }

        let action_name = base_name(&action.slug);
        if !schema::matches(&arguments_schema(action), &request.arguments) {
            return Err(ReactorError::InvalidArguments {
                action: action_name.to_string(),
                arguments: request.arguments.clone(),
            });
        }

        let handler = self
            .library()
            .get(action_name)
            .ok_or_else(|| ReactorError::UnknownHandler(action_name.to_string()))?;

        let ctx = ActionContext::new(self.clone(), request.context.clone());
        handler.handle(session, &ctx, input, request).await
    }

    /// Let the handler adjust a request before it is enqueued.
    pub async fn pre(&self, session: &str, mut request: ActionRequest) -> Result<ActionRequest> {
        let handler = self
            .library()
            .get(&request.action)
            .ok_or_else(|| ReactorError::InvalidAction(request.action.clone()))?;
        let ctx = ActionContext::new(self.clone(), request.context.clone());
        if let Some(arguments) = handler.pre(session, &ctx, &request).await? {
            request.arguments = arguments;
        }
        Ok(request)
    }

    /// Execute a pending request and post its result.
    ///
    /// Execution errors are captured in the posted result; only a failure to
    /// post is returned.
    pub async fn execute(&self, session: &str, pending: &PendingRequest) -> Result<ExecutionEvent> {
        let request = &pending.request;
        info!(
            context = %request.context,
            request = %pending.id,
            action = %request.action,
            input = %request.input,
            actor = %request.actor,
            "executing request"
        );

        let started = Instant::now();
        let outcome = match self.store().get_by_slug(&request.action).await {
            Ok(Some(action)) => self.dispatch(session, &action, request).await,
            Ok(None) => Err(ReactorError::InvalidAction(request.action.clone())),
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(contract) => {
                info!(
                    context = %request.context,
                    action = %request.action,
                    input = %request.input,
                    time_ms = elapsed_ms,
                    "execute success"
                );
                ActionResult::success(contract.map(|c| c.to_json()).unwrap_or(Value::Null))
            }
            Err(e) => {
                if e.is_expected() {
                    warn!(context = %request.context, action = %request.action, input = %request.input, time_ms = elapsed_ms, error = %e, "execute error");
                } else {
                    error!(context = %request.context, action = %request.action, input = %request.input, time_ms = elapsed_ms, error = %e, "execute error");
                }
                ActionResult::failure(&e)
            }
        };

        self.queue()
            .post_results(self.id(), &request.context, pending, &result)
            .await
    }
}

/// Argument schema entry for a nullable string.
pub(crate) fn nullable_string() -> Value {
    json!({ "type": ["null", "string"] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::types;
    use uuid::Uuid;

    fn action(data: Value) -> Contract {
        Contract::from_json(json!({
            "id": Uuid::new_v4(),
            "slug": "action-test",
            "type": types::ACTION,
            "data": data,
            "created_at": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[test]
    fn arguments_schema_requires_every_declared_argument() {
        let schema = arguments_schema(&action(json!({
            "arguments": { "reason": nullable_string(), "patch": { "type": "array" } }
        })));
        assert!(schema::matches(&schema, &json!({ "reason": null, "patch": [] })));
        assert!(!schema::matches(&schema, &json!({ "patch": [] })));
        assert!(!schema::matches(&schema, &json!({ "reason": null, "patch": [], "extra": 1 })));
    }

    #[test]
    fn actions_without_arguments_accept_any_object() {
        let schema = arguments_schema(&action(json!({})));
        assert!(schema::matches(&schema, &json!({ "anything": true })));
        assert!(!schema::matches(&schema, &json!("text")));
    }

    #[test]
    fn builtin_library_strips_versions() {
        let library = ActionLibrary::builtin();
        assert_eq!(library.len(), 3);
        assert!(library.get("action-create-card@1.0.0").is_some());
        assert!(library.get("action-update-card").is_some());
        assert!(library.get("action-delete-everything@1.0.0").is_none());

        let slugs: Vec<_> = library
            .definitions()
            .into_iter()
            .filter_map(|definition| definition.slug)
            .collect();
        assert_eq!(
            slugs,
            vec!["action-create-card", "action-create-event", "action-update-card"]
        );
    }
}
