//! Contract fixtures written through the worker so they run the full pipeline.

use reactor::{types, Contract, ContractDraft, PatchOperation, WriteOptions};
use serde_json::{json, Value};

use super::TestContext;

impl TestContext {
    /// Options for a write made by the system actor with timeline events.
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            attach_events: true,
            actor: Some(self.worker.system_actor().expect("Worker has no actor")),
            ..Default::default()
        }
    }

    /// Insert `draft` as a contract of `type_ref`.
    pub async fn insert(&self, type_ref: &str, draft: ContractDraft) -> Contract {
        let type_contract = self
            .worker
            .type_contract(type_ref)
            .await
            .expect("Unknown type");
        self.worker
            .insert(&self.context, self.session(), &type_contract, self.write_options(), draft)
            .await
            .expect("Insert failed")
            .expect("Insert produced no contract")
    }

    /// Replace `draft` as a contract of `type_ref`.
    pub async fn replace(&self, type_ref: &str, draft: ContractDraft) -> Option<Contract> {
        let type_contract = self
            .worker
            .type_contract(type_ref)
            .await
            .expect("Unknown type");
        self.worker
            .replace(&self.context, self.session(), &type_contract, self.write_options(), draft)
            .await
            .expect("Replace failed")
    }

    /// Patch `contract` with the given operations.
    pub async fn patch(&self, contract: &Contract, operations: Vec<PatchOperation>) -> Option<Contract> {
        let type_contract = self
            .worker
            .type_contract(&contract.type_)
            .await
            .expect("Unknown type");
        self.worker
            .patch(&self.context, self.session(), &type_contract, self.write_options(), contract, operations)
            .await
            .expect("Patch failed")
    }

    /// Re-read a contract from the store.
    pub async fn reload(&self, contract: &Contract) -> Contract {
        use reactor::ContractStore;
        self.store
            .get_by_id(contract.id)
            .await
            .expect("Lookup failed")
            .expect("Contract disappeared")
    }

    pub async fn card(&self, slug: &str, data: Value) -> Contract {
        self.insert(types::CARD, ContractDraft::new(slug).with_data(data))
            .await
    }

    pub async fn user(&self, slug: &str) -> Contract {
        self.insert(types::USER, ContractDraft::new(slug).with_data(json!({ "roles": [] })))
            .await
    }

    /// Link `from` to `to` as `verb`, with `inverse` seen from `to`.
    pub async fn link(&self, from: &Contract, verb: &str, inverse: &str, to: &Contract) -> Contract {
        self.insert(
            types::LINK,
            ContractDraft::new(format!("link-{}-{}-{}", from.id, verb.replace(' ', "-"), to.id))
                .with_name(verb)
                .with_data(json!({
                    "inverseName": inverse,
                    "from": { "id": from.id, "type": from.type_ },
                    "to": { "id": to.id, "type": to.type_ },
                })),
        )
        .await
    }

    /// Declare a relationship between two type slugs.
    pub async fn relationship(&self, verb: &str, inverse: &str, from: &str, to: &str) -> Contract {
        self.insert(
            types::RELATIONSHIP,
            ContractDraft::new(format!(
                "relationship-{}-{}-{}",
                from,
                verb.replace(' ', "-"),
                to
            ))
            .with_name(verb)
            .with_data(json!({
                "inverseName": inverse,
                "from": { "type": from },
                "to": { "type": to },
            })),
        )
        .await
    }

    /// An active transformer with the given input filter.
    pub async fn transformer(&self, slug: &str, input_filter: Value) -> Contract {
        self.insert(
            types::TRANSFORMER,
            ContractDraft::new(slug)
                .with_name(slug)
                .with_data(json!({ "inputFilter": input_filter })),
        )
        .await
    }

    /// Every task generated by `transformer`.
    pub fn tasks_of(&self, transformer: &Contract) -> Vec<Contract> {
        self.store
            .contracts_of_type(types::TASK)
            .into_iter()
            .filter(|task| task.data["transformer"]["id"] == json!(transformer.id))
            .collect()
    }
}

pub fn replace_op(path: &str, value: Value) -> PatchOperation {
    PatchOperation::Replace {
        path: path.into(),
        value,
    }
}

pub fn add_op(path: &str, value: Value) -> PatchOperation {
    PatchOperation::Add {
        path: path.into(),
        value,
    }
}
