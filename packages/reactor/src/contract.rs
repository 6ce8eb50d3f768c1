//! Contract model shared by the store, the queue and the pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ReactorError, Result};

/// Well-known `slug@version` type references.
pub mod types {
    pub const TYPE: &str = "type@1.0.0";
    pub const CARD: &str = "card@1.0.0";
    pub const USER: &str = "user@1.0.0";
    pub const ACTION: &str = "action@1.0.0";
    pub const LINK: &str = "link@1.0.0";
    pub const RELATIONSHIP: &str = "relationship@1.0.0";
    pub const TRIGGERED_ACTION: &str = "triggered-action@1.0.0";
    pub const TRANSFORMER: &str = "transformer@1.0.0";
    pub const TASK: &str = "task@1.0.0";
    pub const CREATE: &str = "create@1.0.0";
    pub const UPDATE: &str = "update@1.0.0";
    pub const CONTRACT_REPOSITORY: &str = "contract-repository@1.0.0";
}

pub const DEFAULT_VERSION: &str = "1.0.0";

/// Fields that change on every write and never count as a content change.
const VOLATILE_FIELDS: [&str; 4] = ["created_at", "updated_at", "linked_at", "links"];

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_active() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A versioned record in the contract store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub slug: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub markers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Populated by queries only, never persisted.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub links: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub linked_at: Map<String, Value>,
}

impl Contract {
    /// `slug@version`, the form slug lookups expect.
    pub fn versioned_slug(&self) -> String {
        format!("{}@{}", self.slug, self.version)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// True when both contracts are equal once volatile bookkeeping is stripped.
    pub fn same_content(&self, other: &Contract) -> bool {
        strip_volatile(self.to_json()) == strip_volatile(other.to_json())
    }

    /// Look up a nested value under `data`.
    pub fn data_at(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.data, |value, key| value.get(key))
    }

    /// Contracts attached under `links[verb]` by the last query.
    pub fn linked(&self, verb: &str) -> Vec<Value> {
        match self.links.get(verb) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn without_links(mut self) -> Self {
        self.links.clear();
        self
    }
}

fn strip_volatile(mut value: Value) -> Value {
    if let Some(object) = value.as_object_mut() {
        for field in VOLATILE_FIELDS {
            object.remove(field);
        }
    }
    value
}

/// A partial contract handed to insert and replace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub links: Map<String, Value>,
}

impl ContractDraft {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: Some(slug.into()),
            data: empty_object(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, type_: impl Into<String>) -> Self {
        self.type_ = Some(type_.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_markers(mut self, markers: Vec<String>) -> Self {
        self.markers = Some(markers);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Event payload describing this draft: everything except the id.
    pub fn event_payload(&self) -> Value {
        let mut value = self.to_json();
        if let Some(object) = value.as_object_mut() {
            object.remove("id");
        }
        value
    }
}

impl From<Contract> for ContractDraft {
    fn from(contract: Contract) -> Self {
        Self {
            id: Some(contract.id),
            slug: Some(contract.slug),
            version: Some(contract.version),
            type_: Some(contract.type_),
            name: contract.name,
            active: Some(contract.active),
            markers: Some(contract.markers),
            tags: Some(contract.tags),
            data: contract.data,
            links: contract.links,
        }
    }
}

/// Split `slug@version` into its parts. A bare slug has no version.
pub fn split_versioned(identifier: &str) -> (&str, Option<&str>) {
    match identifier.split_once('@') {
        Some((slug, version)) => (slug, Some(version)),
        None => (identifier, None),
    }
}

/// Action and type names without their version suffix.
pub fn base_name(identifier: &str) -> &str {
    split_versioned(identifier).0
}

/// Correlation context threaded through logs, requests and results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogContext {
    pub id: String,
}

impl LogContext {
    pub fn new(prefix: &str) -> Self {
        Self {
            id: format!("{}-{}", prefix, Uuid::new_v4()),
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Request to run one action against one input contract.
///
/// Immutable once built; every derived request is a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: Uuid,
    /// `name@version` of the action contract.
    pub action: String,
    pub actor: Uuid,
    /// Input contract id or `slug@version`.
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    pub arguments: Value,
    pub timestamp: DateTime<Utc>,
    pub epoch: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator: Option<Uuid>,
    pub context: LogContext,
}

impl ActionRequest {
    pub fn new(
        action: impl Into<String>,
        actor: Uuid,
        input: impl Into<String>,
        arguments: Value,
        context: LogContext,
    ) -> Self {
        let timestamp = Utc::now();
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            actor,
            input: input.into(),
            input_type: None,
            arguments,
            timestamp,
            epoch: timestamp.timestamp_millis(),
            originator: None,
            context,
        }
    }

    pub fn with_originator(mut self, originator: Option<Uuid>) -> Self {
        self.originator = originator;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self.epoch = timestamp.timestamp_millis();
        self
    }

    pub fn with_input_type(mut self, input_type: impl Into<String>) -> Self {
        self.input_type = Some(input_type.into());
        self
    }
}

/// A request accepted by the queue and waiting for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: Uuid,
    pub worker: String,
    pub session: String,
    pub enqueued_at: DateTime<Utc>,
    pub request: ActionRequest,
}

/// Outcome of executing an action request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub error: bool,
    pub data: Value,
}

impl ActionResult {
    pub fn success(data: Value) -> Self {
        Self { error: false, data }
    }

    pub fn failure(err: &ReactorError) -> Self {
        Self {
            error: true,
            data: err.to_result_payload(),
        }
    }
}

/// Record posted by the queue once a request completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub request: Uuid,
    pub action: String,
    pub worker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originator: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub error: bool,
    pub data: Value,
}
