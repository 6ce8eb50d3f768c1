//! The reactor worker.
//!
//! A `Worker` owns the rule registries and the handles to the store and the
//! queue. It is cheap to clone; every clone shares the same state.
//!
//! # Architecture
//!
//! ```text
//! Worker::run
//!     │
//!     ├─► tick (interval triggers, every tick_interval)
//!     ├─► dequeue ─► execute ─► dispatch ─► handler
//!     │                                       └─► insert / replace / patch
//!     │                                               └─► commit pipeline
//!     └─► sleep poll_interval when idle
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bootstrap::{self, SYSTEM_ACTOR};
use crate::config::WorkerConfig;
use crate::contract::{types, ActionRequest, ActionResult, Contract, LogContext, PendingRequest};
use crate::dispatch::{ActionHandler, ActionLibrary};
use crate::error::{ReactorError, Result};
use crate::registry::{TransformerRegistry, TriggerRegistry};
use crate::side_effects::{SideEffect, SideEffects};
use crate::subscriptions::{NoSubscriptions, SubscriptionEvaluator};
use crate::traits::{ActionQueue, ContractStore, QueryOptions};
use crate::transformers::TransformerHost;
use crate::triggers::{self, TriggeredAction};

/// How long a stopping worker waits for background side effects.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct WorkerInner {
    config: WorkerConfig,
    session: String,
    store: Arc<dyn ContractStore>,
    queue: Arc<dyn ActionQueue>,
    library: ActionLibrary,
    triggers: TriggerRegistry,
    transformers: TransformerRegistry,
    type_contracts: DashMap<String, Contract>,
    subscriptions: Arc<dyn SubscriptionEvaluator>,
    side_effects: SideEffects,
    actor: OnceLock<Uuid>,
}

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    store: Arc<dyn ContractStore>,
    queue: Arc<dyn ActionQueue>,
    config: WorkerConfig,
    library: ActionLibrary,
    subscriptions: Arc<dyn SubscriptionEvaluator>,
    session: Option<String>,
}

impl WorkerBuilder {
    pub fn new(store: Arc<dyn ContractStore>, queue: Arc<dyn ActionQueue>) -> Self {
        Self {
            store,
            queue,
            config: WorkerConfig::default(),
            library: ActionLibrary::builtin(),
            subscriptions: Arc::new(NoSubscriptions),
            session: None,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an extra action handler next to the built-in ones.
    pub fn action(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.library.register(handler);
        self
    }

    pub fn subscriptions(mut self, subscriptions: Arc<dyn SubscriptionEvaluator>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Privileged session used for internal writes and interval triggers.
    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn build(self) -> Worker {
        Worker {
            inner: Arc::new(WorkerInner {
                session: self
                    .session
                    .unwrap_or_else(|| format!("session-{}", Uuid::new_v4())),
                config: self.config,
                store: self.store,
                queue: self.queue,
                library: self.library,
                triggers: TriggerRegistry::new(),
                transformers: TransformerRegistry::new(),
                type_contracts: DashMap::new(),
                subscriptions: self.subscriptions,
                side_effects: SideEffects::new(),
                actor: OnceLock::new(),
            }),
        }
    }
}

/// Executes action requests and reacts to every write it makes.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn builder(store: Arc<dyn ContractStore>, queue: Arc<dyn ActionQueue>) -> WorkerBuilder {
        WorkerBuilder::new(store, queue)
    }

    pub fn store(&self) -> &Arc<dyn ContractStore> {
        &self.inner.store
    }

    pub fn queue(&self) -> &Arc<dyn ActionQueue> {
        &self.inner.queue
    }

    /// Worker id recorded on enqueued requests and posted results.
    pub fn id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn session(&self) -> &str {
        &self.inner.session
    }

    pub fn library(&self) -> &ActionLibrary {
        &self.inner.library
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn side_effects(&self) -> &SideEffects {
        &self.inner.side_effects
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionEvaluator> {
        &self.inner.subscriptions
    }

    /// Id of `user-reactor`, available once [`initialize`](Self::initialize) ran.
    pub fn system_actor(&self) -> Result<Uuid> {
        self.inner
            .actor
            .get()
            .copied()
            .ok_or_else(|| ReactorError::NotFound(format!("{}@1.0.0", SYSTEM_ACTOR)))
    }

    pub fn triggers(&self) -> Arc<Vec<TriggeredAction>> {
        self.inner.triggers.snapshot()
    }

    pub fn set_triggers(&self, triggers: Vec<TriggeredAction>) {
        debug!(count = triggers.len(), "setting triggers");
        self.inner.triggers.set(triggers);
    }

    pub fn upsert_trigger(&self, trigger: TriggeredAction) {
        debug!(slug = %trigger.slug, id = %trigger.id, "upserting trigger");
        self.inner.triggers.upsert(trigger);
    }

    pub fn remove_trigger(&self, id: Uuid) {
        debug!(id = %id, "removing trigger");
        self.inner.triggers.remove(id);
    }

    /// Latest transformer per slug and major version.
    pub fn latest_transformers(&self) -> Vec<Contract> {
        self.inner.transformers.latest()
    }

    pub fn set_transformers(&self, transformers: Vec<Contract>) {
        debug!(count = transformers.len(), "setting transformers");
        self.inner.transformers.set(transformers);
    }

    pub fn upsert_transformer(&self, transformer: Contract) {
        debug!(slug = %transformer.slug, version = %transformer.version, "upserting transformer");
        self.inner.transformers.upsert(transformer);
    }

    pub fn remove_transformer(&self, id: Uuid) {
        debug!(id = %id, "removing transformer");
        self.inner.transformers.remove(id);
    }

    /// Replace the cached type contracts.
    pub fn set_type_contracts(&self, contracts: Vec<Contract>) {
        self.inner.type_contracts.clear();
        for contract in contracts {
            self.cache_type_contract(contract);
        }
    }

    pub fn type_contracts(&self) -> Vec<Contract> {
        let mut contracts: Vec<Contract> = self
            .inner
            .type_contracts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        contracts.sort_by_key(|contract| contract.versioned_slug());
        contracts
    }

    pub(crate) fn cache_type_contract(&self, contract: Contract) {
        self.inner
            .type_contracts
            .insert(contract.versioned_slug(), contract);
    }

    /// Resolve a `slug@version` type reference, from the cache or the store.
    pub async fn type_contract(&self, type_ref: &str) -> Result<Contract> {
        if let Some(cached) = self.inner.type_contracts.get(type_ref) {
            return Ok(cached.value().clone());
        }

        match self.store().get_by_slug(type_ref).await? {
            Some(contract) if contract.type_ == types::TYPE => {
                self.cache_type_contract(contract.clone());
                Ok(contract)
            }
            _ => Err(ReactorError::NoSuchType(type_ref.to_string())),
        }
    }

    /// Run the pre-hook and hand the request to the queue.
    pub async fn enqueue(&self, session: &str, request: ActionRequest) -> Result<PendingRequest> {
        let request = self.pre(session, request).await?;
        self.queue().enqueue(self.id(), session, request).await
    }

    /// Store the bootstrap contracts and load the registries from the store.
    pub async fn initialize(&self) -> Result<()> {
        let context = LogContext::new("initialize");
        info!(context = %context, worker_id = %self.id(), "initializing reactor worker");

        for draft in bootstrap::contracts(self.library()) {
            self.store().replace(draft).await?;
        }

        let actor_slug = format!("{}@1.0.0", SYSTEM_ACTOR);
        let actor = self
            .store()
            .get_by_slug(&actor_slug)
            .await?
            .ok_or(ReactorError::NotFound(actor_slug))?;
        let _ = self.inner.actor.set(actor.id);

        let type_contracts = self
            .store()
            .query(
                &json!({
                    "type": "object",
                    "properties": {
                        "active": { "const": true },
                        "type": { "const": types::TYPE }
                    }
                }),
                QueryOptions::default(),
            )
            .await?;
        self.set_type_contracts(type_contracts.clone());

        let triggers = triggers::active_triggers(self.store().as_ref())
            .await?
            .iter()
            .filter_map(|contract| match TriggeredAction::from_contract(contract) {
                Ok(trigger) => Some(trigger),
                Err(e) => {
                    warn!(context = %context, slug = %contract.slug, error = %e, "skipping invalid triggered action");
                    None
                }
            })
            .collect();
        self.set_triggers(triggers);

        let transformers = self
            .store()
            .query(
                &json!({
                    "type": "object",
                    "properties": {
                        "active": { "const": true },
                        "type": { "const": types::TRANSFORMER }
                    }
                }),
                QueryOptions::default(),
            )
            .await?;
        self.set_transformers(transformers);

        // Replaying the types through commit would be skipped as unchanged,
        // so their formula triggers are registered directly.
        for type_contract in &type_contracts {
            self.side_effects()
                .isolate(
                    &context,
                    SideEffect::TypeTriggers,
                    &type_contract.slug,
                    &type_contract.versioned_slug(),
                    self.refresh_type_triggers(&context, type_contract),
                )
                .await;
        }

        info!(
            context = %context,
            types = type_contracts.len(),
            triggers = self.triggers().len(),
            transformers = self.latest_transformers().len(),
            "reactor worker initialized"
        );
        Ok(())
    }

    /// Process requests and interval triggers until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.id(),
            tick_interval_ms = self.config().tick_interval.as_millis() as u64,
            "reactor worker starting"
        );

        let mut next_tick = Instant::now() + self.config().tick_interval;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if Instant::now() >= next_tick {
                next_tick = Instant::now() + self.config().tick_interval;
                if let Err(e) = self.tick(self.session(), Utc::now()).await {
                    error!(worker_id = %self.id(), error = %e, "tick failed");
                }
            }

            match self.queue().dequeue().await {
                Ok(Some(pending)) => {
                    if let Err(e) = self.execute(&pending.session, &pending).await {
                        error!(request = %pending.id, error = %e, "failed to post results");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to dequeue"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config().poll_interval) => {}
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, self.settle()).await.is_err() {
            warn!(worker_id = %self.id(), "side effects still running at shutdown");
        }

        info!(worker_id = %self.id(), "reactor worker stopped");
        Ok(())
    }

    /// Wait for every background side effect spawned so far.
    pub async fn settle(&self) {
        self.side_effects().settle().await;
    }
}

#[async_trait]
impl TransformerHost for Worker {
    async fn query(&self, schema: &Value, options: QueryOptions) -> Result<Vec<Contract>> {
        self.store().query(schema, options).await
    }

    async fn execute_and_await(&self, request: ActionRequest) -> Result<ActionResult> {
        let context = request.context.clone();
        let pending = self.enqueue(self.session(), request).await?;
        self.queue().wait_results(&context, &pending).await
    }
}
