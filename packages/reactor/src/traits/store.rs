//! Storage trait for contracts.
//!
//! Queries take a JSON schema and must honour the `$$links` extension:
//! returned contracts carry the matching linked contracts under `links`.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::contract::{Contract, ContractDraft};
use crate::error::Result;
use crate::patch::PatchOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Ordering and paging for [`ContractStore::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Top-level field to sort by (e.g. `created_at`).
    pub sort_by: Option<String>,
    pub sort_dir: SortDirection,
    pub limit: Option<usize>,
}

impl QueryOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

/// Versioned contract storage.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Contract>>;

    /// Look up by `slug@version`; `slug@latest` or a bare slug picks the highest version.
    async fn get_by_slug(&self, slug: &str) -> Result<Option<Contract>>;

    async fn query(&self, schema: &Value, options: QueryOptions) -> Result<Vec<Contract>>;

    /// Insert a new contract. Fails if `slug@version` already exists.
    async fn insert(&self, draft: ContractDraft) -> Result<Contract>;

    /// Insert or overwrite the contract with the same `slug@version` (or id).
    async fn replace(&self, draft: ContractDraft) -> Result<Contract>;

    async fn patch_by_slug(&self, slug: &str, patch: &[PatchOperation]) -> Result<Contract>;

    /// Resolve an identifier that is either an id or a `slug@version`.
    async fn get_by_identifier(&self, identifier: &str) -> Result<Option<Contract>> {
        if identifier.contains('@') {
            return self.get_by_slug(identifier).await;
        }
        match Uuid::parse_str(identifier) {
            Ok(id) => self.get_by_id(id).await,
            Err(_) => Ok(None),
        }
    }
}
