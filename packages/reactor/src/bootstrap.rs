//! Contracts every worker needs before it can process anything.

use serde_json::{json, Value};

use crate::contract::{types, ContractDraft};
use crate::dispatch::ActionLibrary;

/// Slug of the actor used for system writes and interval triggers.
pub const SYSTEM_ACTOR: &str = "user-reactor";

fn type_contract(slug: &str, name: &str, schema: Value) -> ContractDraft {
    ContractDraft::new(slug)
        .with_type(types::TYPE)
        .with_version("1.0.0")
        .with_name(name)
        .with_markers(Vec::new())
        .with_data(json!({ "schema": schema }))
}

fn event_schema() -> Value {
    json!({
        "type": "object",
        "required": ["data"],
        "properties": {
            "data": {
                "type": "object",
                "required": ["timestamp", "target", "actor", "payload"],
                "properties": {
                    "timestamp": { "type": "string", "format": "date-time" },
                    "target": { "type": "string", "format": "uuid" },
                    "actor": { "type": "string", "format": "uuid" },
                    "payload": { "type": ["object", "array"] }
                }
            }
        }
    })
}

fn endpoint_schema() -> Value {
    json!({
        "type": "object",
        "required": ["id", "type"],
        "properties": {
            "id": { "type": "string", "format": "uuid" },
            "type": { "type": "string" }
        }
    })
}

/// The built-in type contracts.
pub fn types() -> Vec<ContractDraft> {
    vec![
        type_contract(
            "type",
            "Type",
            json!({
                "type": "object",
                "required": ["slug", "data"],
                "properties": {
                    "slug": { "type": "string", "pattern": "^[a-z0-9-]+$" },
                    "data": {
                        "type": "object",
                        "required": ["schema"],
                        "properties": { "schema": { "type": "object" } }
                    }
                }
            }),
        ),
        type_contract("card", "Card", json!({ "type": "object" })),
        type_contract(
            "user",
            "User",
            json!({
                "type": "object",
                "properties": {
                    "slug": { "type": "string", "pattern": "^user-[a-z0-9-]+$" }
                }
            }),
        ),
        type_contract(
            "action",
            "Action",
            json!({
                "type": "object",
                "required": ["data"],
                "properties": {
                    "slug": { "type": "string", "pattern": "^action-[a-z0-9-]+$" },
                    "data": {
                        "type": "object",
                        "required": ["filter", "arguments"],
                        "properties": {
                            "filter": { "type": "object" },
                            "arguments": { "type": "object" }
                        }
                    }
                }
            }),
        ),
        type_contract(
            "link",
            "Link",
            json!({
                "type": "object",
                "required": ["name", "data"],
                "properties": {
                    "name": { "type": "string" },
                    "data": {
                        "type": "object",
                        "required": ["inverseName", "from", "to"],
                        "properties": {
                            "inverseName": { "type": "string" },
                            "from": endpoint_schema(),
                            "to": endpoint_schema()
                        }
                    }
                }
            }),
        ),
        type_contract(
            "relationship",
            "Relationship",
            json!({
                "type": "object",
                "required": ["name", "data"],
                "properties": {
                    "name": { "type": "string" },
                    "data": {
                        "type": "object",
                        "required": ["inverseName", "from", "to"],
                        "properties": {
                            "inverseName": { "type": "string" },
                            "from": { "type": "object", "required": ["type"] },
                            "to": { "type": "object", "required": ["type"] }
                        }
                    }
                }
            }),
        ),
        type_contract(
            "triggered-action",
            "Triggered action",
            json!({
                "type": "object",
                "required": ["slug", "data"],
                "properties": {
                    "slug": { "type": "string", "pattern": "^triggered-action-[a-z0-9-]+$" },
                    "data": {
                        "type": "object",
                        "properties": {
                            "mode": { "type": "string", "enum": ["insert", "update"] },
                            "type": { "type": "string", "pattern": "^[a-z0-9-]+@\\d+(\\.\\d+)?(\\.\\d+)?" },
                            "startDate": { "type": "string", "format": "date-time" },
                            "interval": { "type": "string" },
                            "filter": { "type": "object" },
                            "action": { "type": "string" },
                            "target": { "type": ["string", "object", "array"] },
                            "arguments": { "type": "object" }
                        },
                        "oneOf": [
                            { "required": ["filter", "action", "target", "arguments"] },
                            { "required": ["interval", "action", "target", "arguments"] }
                        ]
                    }
                }
            }),
        ),
        type_contract(
            "transformer",
            "Transformer",
            json!({
                "type": "object",
                "required": ["data"],
                "properties": {
                    "data": {
                        "type": "object",
                        "properties": {
                            "inputFilter": { "type": "object" },
                            "workerFilter": { "type": "object" }
                        }
                    }
                }
            }),
        ),
        type_contract(
            "task",
            "Task",
            json!({
                "type": "object",
                "required": ["data"],
                "properties": {
                    "data": {
                        "type": "object",
                        "required": ["status"],
                        "properties": {
                            "status": {
                                "type": "string",
                                "enum": ["pending", "running", "completed", "failed"]
                            },
                            "input": { "type": "object" },
                            "transformer": { "type": "object" },
                            "actor": { "type": "string", "format": "uuid" },
                            "workerFilter": { "type": "object" }
                        }
                    }
                }
            }),
        ),
        type_contract("create", "Create event", event_schema()),
        type_contract("update", "Update event", event_schema()),
        type_contract(
            "contract-repository",
            "Contract repository",
            json!({
                "type": "object",
                "required": ["data"],
                "properties": {
                    "data": {
                        "type": "object",
                        "required": ["base_slug"],
                        "properties": { "base_slug": { "type": "string" } }
                    }
                }
            }),
        ),
    ]
}

/// The system actor.
pub fn system_actor() -> ContractDraft {
    ContractDraft::new(SYSTEM_ACTOR)
        .with_type(types::USER)
        .with_version("1.0.0")
        .with_name("Reactor")
        .with_markers(Vec::new())
        .with_data(json!({ "roles": ["user-admin"] }))
}

/// Everything replaced into the store on initialisation, types first.
pub fn contracts(library: &ActionLibrary) -> Vec<ContractDraft> {
    let mut contracts = types();
    contracts.extend(library.definitions());
    contracts.push(system_actor());
    contracts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn every_type_carries_an_object_schema() {
        for draft in types() {
            assert!(draft.data["schema"].is_object(), "{:?}", draft.slug);
            assert_eq!(draft.type_.as_deref(), Some(types::TYPE));
        }
    }

    #[test]
    fn bootstrap_includes_actions_and_actor() {
        let contracts = contracts(&ActionLibrary::builtin());
        let slugs: Vec<_> = contracts.iter().filter_map(|c| c.slug.as_deref()).collect();
        for expected in ["type", "link", "task", "create", "update", "action-create-event", SYSTEM_ACTOR] {
            assert!(slugs.contains(&expected), "missing {}", expected);
        }
    }

    #[test]
    fn triggered_action_schema_requires_filter_or_interval() {
        let schema = types()
            .into_iter()
            .find(|draft| draft.slug.as_deref() == Some("triggered-action"))
            .unwrap()
            .data["schema"]
            .clone();
        let base = json!({ "slug": "triggered-action-x", "data": { "action": "a", "target": "t", "arguments": {} } });

        let mut filter = base.clone();
        filter["data"]["filter"] = json!({ "type": "object" });
        assert!(schema::matches(&schema, &filter));

        let mut interval = base.clone();
        interval["data"]["interval"] = json!("P1D");
        assert!(schema::matches(&schema, &interval));

        assert!(!schema::matches(&schema, &base));
    }
}
