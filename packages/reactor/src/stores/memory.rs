//! In-memory contract store for tests, development and the standalone worker.
//!
//! Links are modelled the same way the reactor writes them: as `link@1.0.0`
//! contracts whose `data.from` / `data.to` carry the endpoint ids. A link is
//! traversable by its `name` from the `from` side and by `data.inverseName`
//! from the `to` side.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::contract::{split_versioned, types, Contract, ContractDraft, DEFAULT_VERSION};
use crate::error::{ReactorError, Result};
use crate::patch::{self, PatchOperation};
use crate::schema;
use crate::traits::store::{ContractStore, QueryOptions, SortDirection};

/// In-memory storage for contracts. Data is lost on restart.
pub struct MemoryStore {
    contracts: RwLock<HashMap<Uuid, Contract>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            contracts: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Contract>> {
        self.contracts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Contract>> {
        self.contracts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of stored contracts.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Every stored contract of the given `slug@version` type.
    pub fn contracts_of_type(&self, type_: &str) -> Vec<Contract> {
        let mut found: Vec<Contract> = self
            .read()
            .values()
            .filter(|c| c.type_ == type_)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found
    }

    fn find_by_slug<'a>(
        contracts: &'a HashMap<Uuid, Contract>,
        identifier: &str,
    ) -> Option<&'a Contract> {
        let (slug, version) = split_versioned(identifier);
        let candidates = contracts.values().filter(|c| c.slug == slug);
        match version {
            None | Some("latest") => candidates.max_by(|a, b| compare_versions(&a.version, &b.version)),
            Some(version) => candidates
                .filter(|c| c.version == version)
                .min_by_key(|c| c.created_at),
        }
    }

    /// Contracts reachable from `id` through `verb`.
    fn linked<'a>(
        contracts: &'a HashMap<Uuid, Contract>,
        id: Uuid,
        verb: &str,
    ) -> Vec<&'a Contract> {
        let endpoint = |link: &Contract, side: &str| -> Option<Uuid> {
            link.data
                .get(side)
                .and_then(|end| end.get("id"))
                .and_then(Value::as_str)
                .and_then(|raw| Uuid::parse_str(raw).ok())
        };

        let mut found: Vec<&Contract> = contracts
            .values()
            .filter(|c| c.type_ == types::LINK && c.active)
            .filter_map(|link| {
                let inverse = link.data.get("inverseName").and_then(Value::as_str);
                if link.name.as_deref() == Some(verb) && endpoint(link, "from") == Some(id) {
                    endpoint(link, "to")
                } else if inverse == Some(verb) && endpoint(link, "to") == Some(id) {
                    endpoint(link, "from")
                } else {
                    None
                }
            })
            .filter_map(|target| contracts.get(&target))
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found.dedup_by_key(|c| c.id);
        found
    }

    /// Attach the links a `$$links` clause asks for, or `None` if one is unsatisfied.
    fn resolve_links(
        contracts: &HashMap<Uuid, Contract>,
        schema: &Value,
        mut contract: Contract,
    ) -> Option<Contract> {
        let Some(Value::Object(verbs)) = schema.get("$$links") else {
            return Some(contract);
        };

        for (verb, subschema) in verbs {
            let linked: Vec<Value> = Self::linked(contracts, contract.id, verb)
                .into_iter()
                .filter_map(|target| Self::resolve_links(contracts, subschema, target.clone()))
                .map(|target| target.to_json())
                .filter(|target| schema::matches(subschema, target))
                .collect();
            if linked.is_empty() {
                return None;
            }
            contract.links.insert(verb.clone(), Value::Array(linked));
        }

        Some(contract)
    }

    fn build(draft: ContractDraft, id: Uuid, created_at: chrono::DateTime<Utc>) -> Result<Contract> {
        let type_ = draft
            .type_
            .ok_or_else(|| ReactorError::InvalidContract("contract is missing a type".into()))?;
        let slug = draft
            .slug
            .unwrap_or_else(|| format!("{}-{}", split_versioned(&type_).0, Uuid::new_v4()));

        Ok(Contract {
            id,
            slug,
            version: draft.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            type_,
            name: draft.name,
            active: draft.active.unwrap_or(true),
            markers: draft.markers.unwrap_or_default(),
            tags: draft.tags.unwrap_or_default(),
            data: draft.data,
            links: Default::default(),
            created_at,
            updated_at: None,
            linked_at: Default::default(),
        })
    }
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl ContractStore for MemoryStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Contract>> {
        Ok(self.read().get(&id).cloned())
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Option<Contract>> {
        Ok(Self::find_by_slug(&self.read(), slug).cloned())
    }

    async fn query(&self, schema: &Value, options: QueryOptions) -> Result<Vec<Contract>> {
        let contracts = self.read();
        let mut results: Vec<Contract> = contracts
            .values()
            .filter_map(|contract| Self::resolve_links(&contracts, schema, contract.clone()))
            .filter(|contract| schema::matches(schema, &contract.to_json()))
            .collect();
        drop(contracts);

        let sort_by = options.sort_by.as_deref().unwrap_or("created_at");
        results.sort_by(|a, b| {
            let (a, b) = (a.to_json(), b.to_json());
            let ordering = compare_fields(a.get(sort_by), b.get(sort_by));
            match options.sort_dir {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn insert(&self, draft: ContractDraft) -> Result<Contract> {
        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let contract = Self::build(draft, id, Utc::now())?;

        let mut contracts = self.write();
        if contracts.contains_key(&contract.id)
            || Self::find_by_slug(&contracts, &contract.versioned_slug()).is_some()
        {
            return Err(ReactorError::AlreadyExists(contract.versioned_slug()));
        }
        debug!(slug = %contract.slug, id = %contract.id, "inserted contract");
        contracts.insert(contract.id, contract.clone());
        Ok(contract)
    }

    async fn replace(&self, draft: ContractDraft) -> Result<Contract> {
        let mut contracts = self.write();
        let existing = draft
            .slug
            .as_ref()
            .and_then(|slug| {
                let version = draft.version.as_deref().unwrap_or(DEFAULT_VERSION);
                Self::find_by_slug(&contracts, &format!("{}@{}", slug, version))
            })
            .or_else(|| draft.id.and_then(|id| contracts.get(&id)))
            .cloned();

        let contract = match existing {
            Some(existing) => {
                let mut contract = Self::build(draft, existing.id, existing.created_at)?;
                if !contract.same_content(&existing) {
                    contract.updated_at = Some(Utc::now());
                } else {
                    contract.updated_at = existing.updated_at;
                }
                contract
            }
            None => {
                let id = draft.id.unwrap_or_else(Uuid::new_v4);
                Self::build(draft, id, Utc::now())?
            }
        };

        debug!(slug = %contract.slug, id = %contract.id, "replaced contract");
        contracts.insert(contract.id, contract.clone());
        Ok(contract)
    }

    async fn patch_by_slug(&self, slug: &str, patch: &[PatchOperation]) -> Result<Contract> {
        let mut contracts = self.write();
        let existing = Self::find_by_slug(&contracts, slug)
            .cloned()
            .ok_or_else(|| ReactorError::NotFound(slug.to_string()))?;

        let document = patch::apply(&existing.clone().without_links().to_json(), patch)?;
        let mut patched = Contract::from_json(document)
            .map_err(|e| ReactorError::InvalidContract(format!("{}: {}", slug, e)))?;
        patched.id = existing.id;
        patched.created_at = existing.created_at;
        patched.links.clear();

        if patched.same_content(&existing) {
            return Ok(existing);
        }
        patched.updated_at = Some(Utc::now());
        contracts.insert(patched.id, patched.clone());
        Ok(patched)
    }
}
