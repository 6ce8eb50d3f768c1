//! Triggered actions: declarative rules that derive action requests.
//!
//! A trigger fires either on a committed contract that matches its `filter`
//! (the `target` template then picks the contracts to act on), or on a time
//! `interval` evaluated by the worker tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::contract::{types, Contract, ContractDraft, ExecutionEvent, LogContext};
use crate::duration::IsoDuration;
use crate::error::{ReactorError, Result};
use crate::expression;
use crate::schema;
use crate::traits::store::{ContractStore, QueryOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    Insert,
    Update,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// `data` of a `triggered-action@1.0.0` contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredActionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TriggerMode>,
    /// Type (`slug@version`) this trigger was derived from.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    pub action: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// A registered trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredAction {
    pub id: Uuid,
    pub slug: String,
    pub version: String,
    pub active: bool,
    pub data: TriggeredActionData,
}

impl TriggeredAction {
    pub fn from_contract(contract: &Contract) -> Result<Self> {
        let data: TriggeredActionData = serde_json::from_value(contract.data.clone())
            .map_err(|e| ReactorError::InvalidContract(format!("{}: {}", contract.slug, e)))?;
        let trigger = Self {
            id: contract.id,
            slug: contract.slug.clone(),
            version: contract.version.clone(),
            active: contract.active,
            data,
        };
        if let Some(interval) = &trigger.data.interval {
            IsoDuration::parse(interval)?;
        }
        Ok(trigger)
    }

    pub fn versioned_slug(&self) -> String {
        format!("{}@{}", self.slug, self.version)
    }

    /// Start of the trigger's validity; the Unix epoch when unset.
    pub fn start_date(&self) -> DateTime<Utc> {
        self.data.start_date.unwrap_or_default()
    }

    pub fn is_interval(&self) -> bool {
        self.data.interval.is_some()
    }
}

/// When an interval trigger should run next.
///
/// `None` for filter triggers. A trigger that never ran, or last ran before
/// its start date, is due at its start date.
pub fn next_execution_date(
    trigger: &TriggeredAction,
    last: Option<&ExecutionEvent>,
) -> Result<Option<DateTime<Utc>>> {
    let Some(interval) = &trigger.data.interval else {
        return Ok(None);
    };
    let start = trigger.start_date();
    match last {
        Some(event) if event.timestamp >= start => {
            Ok(Some(IsoDuration::parse(interval)?.add_to(event.timestamp)?))
        }
        _ => Ok(Some(start)),
    }
}

/// Options for [`get_request`].
#[derive(Debug, Clone)]
pub struct RequestOptions<'a> {
    /// `None` for interval firings, which have no commit mode.
    pub mode: Option<TriggerMode>,
    pub current_date: DateTime<Utc>,
    pub context: &'a LogContext,
}

/// What a firing trigger asks for, before targets are resolved to contracts.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequest {
    pub action: String,
    /// Distinct target identifiers (ids or `slug@version`), in template order.
    pub targets: Vec<String>,
    pub arguments: Value,
    pub originator: Uuid,
    pub context: LogContext,
    pub current_date: DateTime<Utc>,
}

fn template_context(source: Option<&Contract>, current_date: DateTime<Utc>) -> Map<String, Value> {
    let mut context = Map::new();
    context.insert(
        "source".into(),
        source.map(Contract::to_json).unwrap_or(Value::Null),
    );
    context.insert("timestamp".into(), json!(current_date.to_rfc3339()));
    context.insert("epoch".into(), json!(current_date.timestamp_millis()));
    context
}

fn collect_targets(resolved: Value) -> Vec<String> {
    let candidates = match resolved {
        Value::String(target) => vec![target],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(target) => Some(target),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let mut targets: Vec<String> = Vec::with_capacity(candidates.len());
    for target in candidates {
        if !target.is_empty() && !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

/// Evaluate one trigger against a committed contract (or none, for ticks).
pub async fn get_request(
    store: &dyn ContractStore,
    trigger: &TriggeredAction,
    contract: Option<&Contract>,
    options: RequestOptions<'_>,
) -> Result<Option<TriggerRequest>> {
    if options.current_date < trigger.start_date() {
        return Ok(None);
    }

    if let (Some(expected), Some(mode)) = (trigger.data.mode, options.mode) {
        if expected != mode {
            return Ok(None);
        }
    }

    let mut linked_source = None;
    if let Some(filter) = &trigger.data.filter {
        let Some(contract) = contract else {
            return Ok(None);
        };

        if schema::has_links(filter) {
            let mut scoped = filter.clone();
            if let Some(object) = scoped.as_object_mut() {
                let properties = object
                    .entry("properties")
                    .or_insert_with(empty_object);
                if let Some(properties) = properties.as_object_mut() {
                    properties.insert("id".into(), json!({ "const": contract.id }));
                }
            }
            let mut found = store.query(&scoped, QueryOptions::limit(1)).await?;
            if found.is_empty() {
                return Ok(None);
            }
            linked_source = Some(found.remove(0));
        } else if !schema::matches(filter, &contract.to_json()) {
            return Ok(None);
        }
    }

    let source = linked_source.as_ref().or(contract);
    let context = template_context(source, options.current_date);

    let Some(target) = &trigger.data.target else {
        return Ok(None);
    };
    let targets = collect_targets(expression::render_lenient(target, &context));
    if targets.is_empty() {
        debug!(trigger = %trigger.slug, "trigger target resolved to nothing");
        return Ok(None);
    }

    Ok(Some(TriggerRequest {
        action: trigger.data.action.clone(),
        targets,
        arguments: expression::render_lenient(&trigger.data.arguments, &context),
        originator: trigger.id,
        context: options.context.clone(),
        current_date: options.current_date,
    }))
}

/// Active triggers derived from the given `slug@version` type.
pub async fn type_triggers(store: &dyn ContractStore, type_ref: &str) -> Result<Vec<Contract>> {
    store
        .query(
            &json!({
                "type": "object",
                "required": ["active", "type", "data"],
                "properties": {
                    "active": { "const": true },
                    "type": { "const": types::TRIGGERED_ACTION },
                    "data": {
                        "type": "object",
                        "required": ["type"],
                        "properties": { "type": { "const": type_ref } }
                    }
                }
            }),
            QueryOptions::default(),
        )
        .await
}

/// All active triggered actions in the store.
pub async fn active_triggers(store: &dyn ContractStore) -> Result<Vec<Contract>> {
    store
        .query(
            &json!({
                "type": "object",
                "properties": {
                    "active": { "const": true },
                    "type": { "const": types::TRIGGERED_ACTION }
                }
            }),
            QueryOptions::default(),
        )
        .await
}

impl From<&TriggeredAction> for ContractDraft {
    fn from(trigger: &TriggeredAction) -> Self {
        ContractDraft {
            id: Some(trigger.id),
            slug: Some(trigger.slug.clone()),
            version: Some(trigger.version.clone()),
            type_: Some(types::TRIGGERED_ACTION.to_string()),
            active: Some(trigger.active),
            data: serde_json::to_value(&trigger.data).unwrap_or_else(|_| empty_object()),
            ..Default::default()
        }
    }
}
