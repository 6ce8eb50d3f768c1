//! Computed (`$$formula`) fields and the triggers that keep them fresh.
//!
//! A type schema may declare `$$formula` expressions on its properties. They
//! are evaluated against the contract (`contract`) on every write. When a
//! formula reads `contract.links[verb]`, a change on the other side of that
//! link must re-run it, so one triggered action per verb is derived that
//! patches the owning contracts with an empty patch.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::contract::{types, Contract, ContractDraft};
use crate::error::Result;
use crate::expression;
use crate::patch::{self, to_pointer, PatchOperation};
use crate::traits::store::{ContractStore, QueryOptions};

/// A `$$formula` declared at `path` (relative to the contract root).
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub path: Vec<String>,
    pub expression: String,
}

/// Collect every `$$formula` under the `properties` tree of a schema.
pub fn formulas(schema: &Value) -> Vec<Formula> {
    fn walk(schema: &Value, path: &mut Vec<String>, found: &mut Vec<Formula>) {
        if let Some(source) = schema.get("$$formula").and_then(Value::as_str) {
            if !path.is_empty() {
                found.push(Formula {
                    path: path.clone(),
                    expression: source.to_string(),
                });
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, subschema) in properties {
                path.push(key.clone());
                walk(subschema, path, found);
                path.pop();
            }
        }
    }

    let mut found = Vec::new();
    walk(schema, &mut Vec::new(), &mut found);
    found
}

static NO_SCHEMA: Value = Value::Null;

/// The type's `data.schema`, or `null` when it has none.
pub(crate) fn type_schema(type_contract: &Contract) -> &Value {
    type_contract.data.get("schema").unwrap_or(&NO_SCHEMA)
}

/// Link verbs read through `contract.links[...]` by the type's formulas.
pub fn referenced_link_verbs(type_contract: &Contract) -> BTreeSet<String> {
    let mut verbs = BTreeSet::new();
    for formula in formulas(type_schema(type_contract)) {
        match expression::parse(&formula.expression) {
            Ok(expr) => expression::referenced_link_verbs(&expr, &mut verbs),
            Err(e) => debug!(
                type_slug = %type_contract.slug,
                formula = %formula.expression,
                error = %e,
                "skipping unparsable formula"
            ),
        }
    }
    verbs
}

fn set_path(document: &mut Value, path: &[String], value: Value) {
    let mut current = document;
    for key in &path[..path.len() - 1] {
        if !current.get(key).is_some_and(Value::is_object) {
            if let Some(object) = current.as_object_mut() {
                object.insert(key.clone(), Value::Object(Map::new()));
            } else {
                return;
            }
        }
        match current.get_mut(key) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let (Some(object), Some(last)) = (current.as_object_mut(), path.last()) {
        object.insert(last.clone(), value);
    }
}

/// Evaluate every formula of `schema` into `document`.
///
/// A formula that fails to evaluate leaves its field untouched.
pub fn evaluate_object(schema: &Value, document: &mut Value) {
    for formula in formulas(schema) {
        let mut context = Map::new();
        context.insert("contract".into(), document.clone());
        match expression::evaluate(&formula.expression, &context) {
            Ok(value) => set_path(document, &formula.path, value),
            Err(e) => debug!(
                formula = %formula.expression,
                path = %to_pointer(&formula.path),
                error = %e,
                "formula evaluation failed"
            ),
        }
    }
}

/// Extend `operations` so formula fields are recomputed on the patched document.
pub fn evaluate_patch(
    schema: &Value,
    document: &Value,
    operations: &[PatchOperation],
) -> Result<Vec<PatchOperation>> {
    let patched = patch::apply(document, operations)?;
    let mut evaluated = patched.clone();
    evaluate_object(schema, &mut evaluated);

    let mut extended = operations.to_vec();
    for formula in formulas(schema) {
        let pointer = to_pointer(&formula.path);
        let Some(value) = evaluated.pointer(&pointer) else {
            continue;
        };
        if patched.pointer(&pointer) == Some(value) {
            continue;
        }

        // Add at the deepest ancestor that already exists.
        let mut depth = formula.path.len();
        while depth > 1 && patched.pointer(&to_pointer(&formula.path[..depth - 1])).is_none() {
            depth -= 1;
        }
        let ancestor = to_pointer(&formula.path[..depth]);
        if let Some(value) = evaluated.pointer(&ancestor) {
            extended.push(PatchOperation::Add {
                path: ancestor,
                value: value.clone(),
            });
        }
    }
    Ok(extended)
}

/// Lowercase and collapse everything outside `[a-z0-9-]` into single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.trim().to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            c
        } else {
            '-'
        };
        if c == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(c);
    }
    slug
}

/// A relationship declaration seen from one side.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub name: String,
    pub inverse_name: String,
    pub from_type: String,
    pub to_type: String,
}

impl Relationship {
    pub fn from_contract(contract: &Contract) -> Option<Self> {
        let side = |key: &str| {
            contract
                .data
                .get(key)
                .and_then(|side| side.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Some(Self {
            name: contract.name.clone()?,
            inverse_name: contract.data.get("inverseName")?.as_str()?.to_string(),
            from_type: side("from")?,
            to_type: side("to")?,
        })
    }

    fn reversed(&self) -> Self {
        Self {
            name: self.inverse_name.clone(),
            inverse_name: self.name.clone(),
            from_type: self.to_type.clone(),
            to_type: self.from_type.clone(),
        }
    }
}

/// Relationships that reach `type_ref` through `verb`, expressed from the
/// other side and grouped by the verb that side uses.
pub fn reverse_relationship(
    relationships: &[Relationship],
    type_ref: &str,
    verb: &str,
) -> BTreeMap<String, Vec<Relationship>> {
    let type_slug = crate::contract::base_name(type_ref);
    let mut groups: BTreeMap<String, Vec<Relationship>> = BTreeMap::new();

    for relationship in relationships {
        let reversed = if relationship.name == verb
            && (relationship.from_type == type_slug || relationship.from_type == "*")
        {
            relationship.reversed()
        } else if relationship.inverse_name == verb
            && (relationship.to_type == type_slug || relationship.to_type == "*")
        {
            relationship.clone()
        } else {
            continue;
        };
        groups.entry(reversed.name.clone()).or_default().push(reversed);
    }

    groups
}

/// Build the formula-refresh trigger for one link verb group.
pub fn create_link_trigger(
    type_contract: &Contract,
    verb: &str,
    relationships: &[Relationship],
) -> ContractDraft {
    let type_ref = type_contract.versioned_slug();
    let type_filter = if relationships.iter().any(|r| r.from_type == "*") {
        json!({
            "type": "string",
            "not": { "enum": [types::CREATE, types::UPDATE, types::LINK] }
        })
    } else {
        let allowed: Vec<String> = relationships
            .iter()
            .map(|r| format!("{}@1.0.0", r.from_type))
            .collect();
        json!({ "type": "string", "enum": allowed })
    };

    ContractDraft::new(slugify(&format!(
        "triggered-action-formula-update-{}-{}",
        type_contract.slug, verb
    )))
    .with_type(types::TRIGGERED_ACTION)
    .with_version(type_contract.version.clone())
    .with_active(true)
    .with_markers(Vec::new())
    .with_data(json!({
        "action": "action-update-card@1.0.0",
        "type": type_ref,
        "target": {
            "$map": { "$eval": format!("source.links['{}']", verb) },
            "each(card)": { "$eval": "card.id" }
        },
        "arguments": {
            "reason": "formula re-evaluation",
            "patch": []
        },
        "filter": {
            "type": "object",
            "required": ["type", "data"],
            "$$links": {
                verb: {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "type": { "type": "string", "const": type_ref }
                    }
                }
            },
            "properties": {
                "type": type_filter,
                "updated_at": true
            }
        }
    }))
}

/// Active relationship declarations in the store.
pub async fn relationships(store: &dyn ContractStore) -> Result<Vec<Relationship>> {
    let contracts = store
        .query(
            &json!({
                "type": "object",
                "properties": {
                    "active": { "const": true },
                    "type": { "const": types::RELATIONSHIP }
                }
            }),
            QueryOptions::default(),
        )
        .await?;
    Ok(contracts.iter().filter_map(Relationship::from_contract).collect())
}

/// Every formula-refresh trigger derivable from a type and the known relationships.
pub fn derive_triggers(relationships: &[Relationship], type_contract: &Contract) -> Vec<ContractDraft> {
    let type_ref = type_contract.versioned_slug();
    referenced_link_verbs(type_contract)
        .into_iter()
        .flat_map(|verb| reverse_relationship(relationships, &type_ref, &verb))
        .filter(|(_, group)| !group.is_empty())
        .map(|(verb, group)| create_link_trigger(type_contract, &verb, &group))
        .collect()
}
