//! The commit pipeline.
//!
//! Every write made through the worker runs through [`Worker::commit`]:
//!
//! ```text
//! write ─► idempotence check ─► transformers (background)
//!                             ─► subscriptions (background)
//!                             ─► triggers (enqueue derived requests)
//!                             ─► timeline event
//!                             ─► marker propagation
//!                             ─► type trigger re-registration
//!                             ─► registry sync
//! ```
//!
//! Only the write itself and the timeline event can fail the commit. Every
//! other step is isolated per item through [`SideEffects`](crate::side_effects::SideEffects).

use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::{self, join_all};
use futures::{stream, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::actions::CREATE_EVENT;
use crate::contract::{types, ActionRequest, Contract, ContractDraft, LogContext, DEFAULT_VERSION};
use crate::dispatch::ActionContext;
use crate::error::{ReactorError, Result};
use crate::formulas::{self, type_schema};
use crate::patch::PatchOperation;
use crate::side_effects::SideEffect;
use crate::traits::store::QueryOptions;
use crate::transformers;
use crate::triggers::{self, RequestOptions, TriggerMode, TriggeredAction};
use crate::worker::Worker;

/// Per-write options.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Record a timeline event for the write.
    pub attach_events: bool,
    /// Event time; the commit time when unset.
    pub timestamp: Option<DateTime<Utc>>,
    /// Event name.
    pub reason: Option<String>,
    /// Actor for events and derived requests; the system actor when unset.
    pub actor: Option<Uuid>,
    /// Causal chain to carry into derived requests.
    pub originator: Option<Uuid>,
    /// Time triggers are evaluated at; now when unset.
    pub current_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
        }
    }
}

/// Description of a write for its timeline event.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub kind: EventKind,
    /// The written object for creates, the patch for updates.
    pub payload: Value,
}

fn timeline_query(contract: &Contract) -> Value {
    json!({
        "type": "object",
        "required": ["slug", "version", "type"],
        "properties": {
            "slug": { "type": "string" },
            "version": { "type": "string" },
            "type": { "type": "string" }
        },
        "$$links": {
            "is attached to": {
                "type": "object",
                "required": ["slug", "type"],
                "properties": {
                    "slug": { "type": "string", "const": contract.slug },
                    "type": { "type": "string", "const": contract.type_ }
                }
            }
        }
    })
}

impl Worker {
    /// Run `write` and fan out its side effects.
    ///
    /// Returns `None` when the write did nothing or produced no content change.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit<F, Fut>(
        &self,
        context: &LogContext,
        session: &str,
        type_contract: &Contract,
        previous: Option<&Contract>,
        options: &WriteOptions,
        mutation: Option<Mutation>,
        write: F,
    ) -> Result<Option<Contract>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Contract>>>,
    {
        if !type_schema(type_contract).is_object() {
            return Err(ReactorError::InvalidType(type_contract.versioned_slug()));
        }

        let Some(contract) = write().await? else {
            return Ok(None);
        };

        if previous.is_some_and(|previous| previous.same_content(&contract)) {
            debug!(context = %context, slug = %contract.slug, "no content change, skipping side effects");
            return Ok(None);
        }

        let current_time = options.current_time.unwrap_or_else(Utc::now);

        self.spawn_transformers(context, previous, &contract);
        self.spawn_subscriptions(context, previous, &contract);
        self.run_triggers(context, session, previous.is_some(), &contract, options, current_time)
            .await;

        if options.attach_events {
            if let Some(mutation) = mutation {
                self.attach_event(context, session, &contract, options, mutation, current_time)
                    .await?;
            }
        }

        if let Some(previous) = previous {
            if previous.markers != contract.markers {
                self.side_effects()
                    .isolate(
                        context,
                        SideEffect::MarkerPropagation,
                        &contract.slug,
                        "is attached to",
                        self.propagate_markers(context, &contract),
                    )
                    .await;
            }
        }

        if contract.type_ == types::TYPE {
            self.side_effects()
                .isolate(
                    context,
                    SideEffect::TypeTriggers,
                    &contract.slug,
                    &contract.versioned_slug(),
                    self.refresh_type_triggers(context, &contract),
                )
                .await;
        }

        self.sync_registries(context, &contract);
        Ok(Some(contract))
    }

    fn spawn_transformers(&self, context: &LogContext, previous: Option<&Contract>, contract: &Contract) {
        let latest = self.latest_transformers();
        if latest.is_empty() {
            return;
        }

        let worker = self.clone();
        let previous = previous.cloned();
        let current = contract.clone();
        let ctx = context.clone();
        self.side_effects().spawn(
            context.clone(),
            SideEffect::Transformer,
            contract.slug.clone(),
            format!("{} transformers", latest.len()),
            async move {
                transformers::evaluate(&worker, &latest, previous.as_ref(), &current, &ctx)
                    .await
                    .map(|_| ())
            },
        );
    }

    fn spawn_subscriptions(&self, context: &LogContext, previous: Option<&Contract>, contract: &Contract) {
        let worker = self.clone();
        let previous = previous.cloned();
        let current = contract.clone();
        let ctx = context.clone();
        self.side_effects().spawn(
            context.clone(),
            SideEffect::Subscription,
            contract.slug.clone(),
            "subscriptions".into(),
            async move {
                worker
                    .subscriptions()
                    .evaluate(&worker, &ctx, previous.as_ref(), &current)
                    .await
            },
        );
    }

    async fn run_triggers(
        &self,
        context: &LogContext,
        session: &str,
        is_update: bool,
        contract: &Contract,
        options: &WriteOptions,
        current_time: DateTime<Utc>,
    ) {
        let triggers = self.triggers();
        let mode = if is_update {
            TriggerMode::Update
        } else {
            TriggerMode::Insert
        };

        join_all(triggers.iter().filter(|trigger| trigger.data.filter.is_some()).map(|trigger| {
            self.side_effects().isolate(
                context,
                SideEffect::Trigger,
                &contract.slug,
                &trigger.slug,
                self.fire_trigger(context, session, trigger, contract, mode, options, current_time),
            )
        }))
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn fire_trigger(
        &self,
        context: &LogContext,
        session: &str,
        trigger: &TriggeredAction,
        contract: &Contract,
        mode: TriggerMode,
        options: &WriteOptions,
        current_time: DateTime<Utc>,
    ) -> Result<usize> {
        let request = triggers::get_request(
            self.store().as_ref(),
            trigger,
            Some(contract),
            RequestOptions {
                mode: Some(mode),
                current_date: current_time,
                context,
            },
        )
        .await?;
        let Some(request) = request else {
            return Ok(0);
        };

        let actor = match options.actor {
            Some(actor) => actor,
            None => self.system_actor()?,
        };

        // Resolve every target before enqueueing anything.
        let mut inputs = Vec::with_capacity(request.targets.len());
        for target in &request.targets {
            let input = self
                .store()
                .get_by_identifier(target)
                .await?
                .ok_or_else(|| ReactorError::TriggerTargetMissing {
                    trigger: trigger.slug.clone(),
                    target: target.clone(),
                })?;
            inputs.push(input);
        }

        for input in &inputs {
            let derived = ActionRequest::new(
                request.action.clone(),
                actor,
                input.id.to_string(),
                request.arguments.clone(),
                request.context.clone(),
            )
            .with_timestamp(request.current_date)
            .with_originator(Some(options.originator.unwrap_or(request.originator)));

            info!(
                context = %context,
                trigger = %trigger.slug,
                contract = %input.id,
                action = %derived.action,
                "enqueueing action request due to triggered action"
            );
            self.enqueue(session, derived).await?;
        }
        Ok(inputs.len())
    }

    async fn attach_event(
        &self,
        context: &LogContext,
        session: &str,
        contract: &Contract,
        options: &WriteOptions,
        mutation: Mutation,
        current_time: DateTime<Utc>,
    ) -> Result<()> {
        let handler = self
            .library()
            .get(CREATE_EVENT)
            .ok_or_else(|| ReactorError::UnknownHandler(CREATE_EVENT.to_string()))?;
        let actor = match options.actor {
            Some(actor) => actor,
            None => self.system_actor()?,
        };

        let request = ActionRequest::new(
            CREATE_EVENT,
            actor,
            contract.id.to_string(),
            json!({
                "name": options.reason,
                "type": mutation.kind.as_str(),
                "payload": mutation.payload,
                "tags": [],
            }),
            context.clone(),
        )
        .with_timestamp(options.timestamp.unwrap_or(current_time))
        .with_originator(options.originator);

        let ctx = ActionContext::new(self.clone(), context.clone());
        handler.handle(session, &ctx, contract.clone(), &request).await?;
        Ok(())
    }

    /// Copy `contract.markers` onto every attached event whose markers differ.
    async fn propagate_markers(&self, context: &LogContext, contract: &Contract) -> Result<usize> {
        let timeline = self
            .store()
            .query(&timeline_query(contract), QueryOptions::default())
            .await?;

        let mut patched = 0;
        for event in timeline.iter().filter(|event| event.markers != contract.markers) {
            let slug = event.versioned_slug();
            let replaced = self
                .side_effects()
                .isolate(
                    context,
                    SideEffect::MarkerPropagation,
                    &contract.slug,
                    &slug,
                    self.store().patch_by_slug(
                        &slug,
                        &[PatchOperation::Replace {
                            path: "/markers".into(),
                            value: json!(contract.markers),
                        }],
                    ),
                )
                .await;
            if replaced.is_some() {
                patched += 1;
            }
        }

        debug!(context = %context, slug = %contract.slug, patched, "propagated markers to timeline");
        Ok(patched)
    }

    /// Replace the formula triggers derived from `type_contract`.
    pub(crate) async fn refresh_type_triggers(&self, context: &LogContext, type_contract: &Contract) -> Result<()> {
        let type_ref = type_contract.versioned_slug();
        self.cache_type_contract(type_contract.clone());
        let concurrency = self.config().type_trigger_concurrency.max(1);

        let stale = triggers::type_triggers(self.store().as_ref(), &type_ref).await?;
        stream::iter(stale)
            .map(|trigger| async move {
                let slug = trigger.versioned_slug();
                let deactivated = self
                    .store()
                    .patch_by_slug(
                        &slug,
                        &[PatchOperation::Replace {
                            path: "/active".into(),
                            value: json!(false),
                        }],
                    )
                    .await
                    .map(|_| self.remove_trigger(trigger.id));
                (slug, deactivated)
            })
            .buffer_unordered(concurrency)
            .for_each(|(slug, outcome)| {
                if let Err(e) = outcome {
                    self.side_effects()
                        .report(context, SideEffect::TypeTriggers, &type_ref, &slug, &e);
                }
                future::ready(())
            })
            .await;

        let relationships = formulas::relationships(self.store().as_ref()).await?;
        let derived = formulas::derive_triggers(&relationships, type_contract);
        let count = derived.len();
        stream::iter(derived)
            .map(|draft| async move {
                let slug = draft.slug.clone().unwrap_or_default();
                let registered = async {
                    let stored = self.store().replace(draft).await?;
                    self.upsert_trigger(TriggeredAction::from_contract(&stored)?);
                    Ok::<_, ReactorError>(())
                }
                .await;
                (slug, registered)
            })
            .buffer_unordered(concurrency)
            .for_each(|(slug, outcome)| {
                if let Err(e) = outcome {
                    self.side_effects()
                        .report(context, SideEffect::TypeTriggers, &type_ref, &slug, &e);
                }
                future::ready(())
            })
            .await;

        debug!(context = %context, type_slug = %type_ref, triggers = count, "registered formula triggers");
        Ok(())
    }

    /// Keep the in-memory registries in step with committed rules.
    fn sync_registries(&self, context: &LogContext, contract: &Contract) {
        match contract.type_.as_str() {
            types::TRIGGERED_ACTION if contract.active => match TriggeredAction::from_contract(contract) {
                Ok(trigger) => self.upsert_trigger(trigger),
                Err(e) => self.side_effects().report(
                    context,
                    SideEffect::RegistrySync,
                    &contract.slug,
                    types::TRIGGERED_ACTION,
                    &e,
                ),
            },
            types::TRIGGERED_ACTION => self.remove_trigger(contract.id),
            types::TRANSFORMER if contract.active => self.upsert_transformer(contract.clone()),
            types::TRANSFORMER => self.remove_transformer(contract.id),
            _ => {}
        }
    }

    async fn find_current(&self, slug: Option<&str>, version: &str, id: Option<Uuid>) -> Result<Option<Contract>> {
        if let Some(slug) = slug {
            if let Some(found) = self.store().get_by_slug(&format!("{}@{}", slug, version)).await? {
                return Ok(Some(found));
            }
        }
        match id {
            Some(id) => self.store().get_by_id(id).await,
            None => Ok(None),
        }
    }

    /// Load the links the type's formulas read into `document.links`.
    async fn attach_formula_links(
        &self,
        type_contract: &Contract,
        document: &mut Value,
        id: Option<Uuid>,
    ) -> Result<()> {
        let verbs = formulas::referenced_link_verbs(type_contract);
        if verbs.is_empty() {
            return Ok(());
        }

        let mut links = Map::new();
        for verb in verbs {
            let linked = match id {
                Some(id) => self
                    .store()
                    .query(
                        &json!({
                            "type": "object",
                            "properties": { "id": { "const": id } },
                            "$$links": { verb.as_str(): { "type": "object" } }
                        }),
                        QueryOptions::limit(1),
                    )
                    .await?
                    .into_iter()
                    .next()
                    .map(|found| found.linked(&verb))
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            links.insert(verb, Value::Array(linked));
        }

        if let Some(object) = document.as_object_mut() {
            object.insert("links".into(), Value::Object(links));
        }
        Ok(())
    }

    /// Evaluate the type's formulas into a draft.
    async fn evaluate_draft(
        &self,
        type_contract: &Contract,
        draft: ContractDraft,
        id: Option<Uuid>,
    ) -> Result<ContractDraft> {
        let schema = type_schema(type_contract);
        if formulas::formulas(schema).is_empty() {
            return Ok(draft);
        }

        let mut document = draft.to_json();
        self.attach_formula_links(type_contract, &mut document, id).await?;
        formulas::evaluate_object(schema, &mut document);
        if let Some(object) = document.as_object_mut() {
            object.remove("links");
        }
        ContractDraft::from_json(document)
    }

    /// Insert a new contract of `type_contract`.
    pub async fn insert(
        &self,
        context: &LogContext,
        session: &str,
        type_contract: &Contract,
        options: WriteOptions,
        mut draft: ContractDraft,
    ) -> Result<Option<Contract>> {
        debug!(
            context = %context,
            slug = ?draft.slug,
            type_slug = %type_contract.slug,
            attach_events = options.attach_events,
            "inserting contract"
        );

        draft.type_ = Some(type_contract.versioned_slug());
        let current = self
            .find_current(
                draft.slug.as_deref(),
                draft.version.as_deref().unwrap_or("latest"),
                draft.id,
            )
            .await?;
        let mutation = Mutation {
            kind: EventKind::Create,
            payload: draft.event_payload(),
        };
        let id = draft.id;

        self.commit(
            context,
            session,
            type_contract,
            current.as_ref(),
            &options,
            Some(mutation),
            move || async move {
                let draft = self.evaluate_draft(type_contract, draft, id).await?;
                self.store().insert(draft).await.map(Some)
            },
        )
        .await
    }

    /// Insert or overwrite by `slug@version`.
    ///
    /// A timeline event is attached only when nothing was replaced.
    pub async fn replace(
        &self,
        context: &LogContext,
        session: &str,
        type_contract: &Contract,
        options: WriteOptions,
        mut draft: ContractDraft,
    ) -> Result<Option<Contract>> {
        debug!(
            context = %context,
            slug = ?draft.slug,
            type_slug = %type_contract.slug,
            "replacing contract"
        );

        draft.type_ = Some(type_contract.versioned_slug());
        let current = self
            .find_current(
                draft.slug.as_deref(),
                draft.version.as_deref().unwrap_or(DEFAULT_VERSION),
                draft.id,
            )
            .await?;
        let options = WriteOptions {
            attach_events: current.is_none(),
            ..options
        };
        let mutation = current.is_none().then(|| Mutation {
            kind: EventKind::Create,
            payload: draft.event_payload(),
        });
        let id = draft.id.or(current.as_ref().map(|c| c.id));

        self.commit(
            context,
            session,
            type_contract,
            current.as_ref(),
            &options,
            mutation,
            move || async move {
                let draft = self.evaluate_draft(type_contract, draft, id).await?;
                self.store().replace(draft).await.map(Some)
            },
        )
        .await
    }

    /// Apply a JSON patch to `contract`, extended with recomputed formulas.
    pub async fn patch(
        &self,
        context: &LogContext,
        session: &str,
        type_contract: &Contract,
        options: WriteOptions,
        contract: &Contract,
        patch: Vec<PatchOperation>,
    ) -> Result<Option<Contract>> {
        if contract.version.is_empty() {
            return Err(ReactorError::InvalidVersion(contract.slug.clone()));
        }

        debug!(
            context = %context,
            slug = %contract.slug,
            version = %contract.version,
            type_slug = %type_contract.slug,
            attach_events = options.attach_events,
            operations = patch.len(),
            "patching contract"
        );

        let mutation = Mutation {
            kind: EventKind::Update,
            payload: serde_json::to_value(&patch)?,
        };

        self.commit(
            context,
            session,
            type_contract,
            Some(contract),
            &options,
            Some(mutation),
            move || async move {
                let mut document = contract.clone().without_links().to_json();
                self.attach_formula_links(type_contract, &mut document, Some(contract.id))
                    .await?;
                let operations =
                    formulas::evaluate_patch(type_schema(type_contract), &document, &patch)?;
                self.store()
                    .patch_by_slug(&contract.versioned_slug(), &operations)
                    .await
                    .map(Some)
            },
        )
        .await
    }
}
