//! In-memory working sets of triggers and transformers.
//!
//! Writers serialise on the lock and publish a fresh `Arc` snapshot; readers
//! clone the `Arc` and never hold the lock across an await. An evaluation
//! therefore always sees one consistent set, even while a commit mutates it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use semver::Version;
use tracing::warn;
use uuid::Uuid;

use crate::contract::Contract;
use crate::triggers::TriggeredAction;

fn load<T: ?Sized>(lock: &RwLock<Arc<T>>) -> Arc<T> {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Registered triggered actions.
#[derive(Default)]
pub struct TriggerRegistry {
    triggers: RwLock<Arc<Vec<TriggeredAction>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current triggers.
    pub fn snapshot(&self) -> Arc<Vec<TriggeredAction>> {
        load(&self.triggers)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn update(&self, change: impl FnOnce(&mut Vec<TriggeredAction>)) {
        let mut guard = self
            .triggers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = guard.as_ref().clone();
        change(&mut next);
        *guard = Arc::new(next);
    }

    pub fn set(&self, triggers: Vec<TriggeredAction>) {
        self.update(|current| *current = triggers);
    }

    /// Add a trigger, replacing any registered with the same id.
    pub fn upsert(&self, trigger: TriggeredAction) {
        self.update(|current| match current.iter_mut().find(|t| t.id == trigger.id) {
            Some(existing) => *existing = trigger,
            None => current.push(trigger),
        });
    }

    pub fn remove(&self, id: Uuid) {
        self.update(|current| current.retain(|t| t.id != id));
    }
}

/// All registered transformers plus the derived latest-per-major view.
#[derive(Debug, Default, Clone)]
pub struct TransformerSet {
    pub all: Vec<Contract>,
    pub latest: Vec<Contract>,
}

impl TransformerSet {
    fn new(all: Vec<Contract>) -> Self {
        let latest = latest_per_major(&all);
        Self { all, latest }
    }
}

/// Keep, per `(slug, major)`, the highest non-prerelease version.
pub fn latest_per_major(transformers: &[Contract]) -> Vec<Contract> {
    let mut latest: HashMap<(String, u64), (Version, &Contract)> = HashMap::new();
    let mut order: Vec<(String, u64)> = Vec::new();

    for transformer in transformers {
        let version = match Version::parse(&transformer.version) {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    slug = %transformer.slug,
                    version = %transformer.version,
                    error = %e,
                    "ignoring transformer with invalid version"
                );
                continue;
            }
        };
        if !version.pre.is_empty() {
            continue;
        }

        let key = (transformer.slug.clone(), version.major);
        match latest.get(&key) {
            Some((current, _)) if *current >= version => {}
            Some(_) => {
                latest.insert(key, (version, transformer));
            }
            None => {
                order.push(key.clone());
                latest.insert(key, (version, transformer));
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| latest.remove(&key).map(|(_, t)| t.clone()))
        .collect()
}

/// Registered transformers.
#[derive(Default)]
pub struct TransformerRegistry {
    set: RwLock<Arc<TransformerSet>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<TransformerSet> {
        load(&self.set)
    }

    /// Latest transformer per slug and major version.
    pub fn latest(&self) -> Vec<Contract> {
        self.snapshot().latest.clone()
    }

    fn update(&self, change: impl FnOnce(&mut Vec<Contract>)) {
        let mut guard = self
            .set
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all = guard.all.clone();
        change(&mut all);
        *guard = Arc::new(TransformerSet::new(all));
    }

    pub fn set(&self, transformers: Vec<Contract>) {
        self.update(|current| *current = transformers);
    }

    pub fn upsert(&self, transformer: Contract) {
        self.update(|current| match current.iter_mut().find(|t| t.id == transformer.id) {
            Some(existing) => *existing = transformer,
            None => current.push(transformer),
        });
    }

    pub fn remove(&self, id: Uuid) {
        self.update(|current| current.retain(|t| t.id != id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::types;
    use serde_json::json;

    fn transformer(slug: &str, version: &str) -> Contract {
        Contract::from_json(json!({
            "id": Uuid::new_v4(),
            "slug": slug,
            "version": version,
            "type": types::TRANSFORMER,
            "data": { "inputFilter": { "type": "object" } },
            "created_at": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    fn trigger(slug: &str) -> TriggeredAction {
        TriggeredAction::from_contract(
            &Contract::from_json(json!({
                "id": Uuid::new_v4(),
                "slug": slug,
                "type": types::TRIGGERED_ACTION,
                "data": { "action": "action-update-card@1.0.0", "target": "x", "arguments": {} },
                "created_at": "2024-01-01T00:00:00Z",
            }))
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn latest_keeps_highest_stable_version_per_major() {
        let set = vec![
            transformer("t", "1.0.0"),
            transformer("t", "1.2.0"),
            transformer("t", "1.3.0-beta.1"),
            transformer("t", "2.0.0"),
            transformer("other", "1.0.0"),
        ];
        let latest = latest_per_major(&set);
        let versions: Vec<_> = latest
            .iter()
            .map(|t| format!("{}@{}", t.slug, t.version))
            .collect();
        assert_eq!(versions, vec!["t@1.2.0", "t@2.0.0", "other@1.0.0"]);
    }

    #[test]
    fn transformer_registry_recomputes_latest_on_mutation() {
        let registry = TransformerRegistry::new();
        let old = transformer("t", "1.0.0");
        let new = transformer("t", "1.1.0");
        registry.set(vec![old.clone()]);
        assert_eq!(registry.latest()[0].id, old.id);

        registry.upsert(new.clone());
        assert_eq!(registry.latest().len(), 1);
        assert_eq!(registry.latest()[0].id, new.id);

        registry.remove(new.id);
        assert_eq!(registry.latest()[0].id, old.id);
        assert_eq!(registry.snapshot().all.len(), 1);
    }

    #[test]
    fn snapshots_are_unaffected_by_later_writes() {
        let registry = TriggerRegistry::new();
        let first = trigger("triggered-action-a");
        registry.set(vec![first.clone()]);

        let snapshot = registry.snapshot();
        registry.upsert(trigger("triggered-action-b"));
        registry.remove(first.id);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].slug, "triggered-action-b");
    }

    #[test]
    fn upsert_replaces_by_id() {
        let registry = TriggerRegistry::new();
        let mut trigger = trigger("triggered-action-a");
        registry.upsert(trigger.clone());
        trigger.data.action = "action-create-card@1.0.0".into();
        registry.upsert(trigger.clone());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].data.action, "action-create-card@1.0.0");
    }
}
