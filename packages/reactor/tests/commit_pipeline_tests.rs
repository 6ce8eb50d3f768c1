//! Integration tests for the commit pipeline: triggers, idempotence, events
//! and side-effect isolation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use reactor::{
    types, Contract, ContractDraft, LogContext, ReactorError, SubscriptionEvaluator, Worker,
};
use serde_json::json;
use test_context::{test_context, AsyncTestContext};

/// Trigger that flags newly inserted open cards.
async fn flag_open_cards(ctx: &TestContext) -> Contract {
    ctx.insert(
        types::TRIGGERED_ACTION,
        ContractDraft::new("triggered-action-flag-open-cards").with_data(json!({
            "mode": "insert",
            "filter": {
                "type": "object",
                "required": ["type", "data"],
                "properties": {
                    "type": { "const": types::CARD },
                    "data": {
                        "type": "object",
                        "required": ["status"],
                        "properties": { "status": { "const": "open" } }
                    }
                }
            },
            "action": "action-update-card@1.0.0",
            "target": { "$eval": "source.id" },
            "arguments": {
                "reason": "flagged",
                "patch": [{ "op": "add", "path": "/data/flagged", "value": true }]
            }
        })),
    )
    .await
}

fn originated_by(ctx: &TestContext, trigger: &Contract) -> usize {
    ctx.queue
        .enqueued_requests()
        .iter()
        .filter(|pending| pending.request.originator == Some(trigger.id))
        .count()
}

fn events_of(ctx: &TestContext, event_type: &str, card: &Contract) -> Vec<Contract> {
    ctx.store
        .contracts_of_type(event_type)
        .into_iter()
        .filter(|event| event.data["target"] == json!(card.id))
        .collect()
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_non_matching_filter_enqueues_nothing(ctx: &TestContext) {
    let trigger = flag_open_cards(ctx).await;

    let closed = ctx.card("card-closed", json!({ "status": "closed" })).await;
    ctx.wait_idle().await;

    assert_eq!(originated_by(ctx, &trigger), 0);
    assert!(ctx.reload(&closed).await.data.get("flagged").is_none());
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_matching_filter_runs_the_action(ctx: &TestContext) {
    let trigger = flag_open_cards(ctx).await;

    let open = ctx.card("card-open", json!({ "status": "open" })).await;
    let flagged = ctx
        .wait_for_match(&json!({
            "type": "object",
            "required": ["slug", "data"],
            "properties": {
                "slug": { "const": "card-open" },
                "data": {
                    "type": "object",
                    "required": ["flagged"],
                    "properties": { "flagged": { "const": true } }
                }
            }
        }))
        .await;
    ctx.wait_idle().await;

    assert_eq!(flagged.id, open.id);
    assert_eq!(originated_by(ctx, &trigger), 1);

    let request = ctx
        .queue
        .enqueued_requests()
        .into_iter()
        .find(|pending| pending.request.originator == Some(trigger.id))
        .unwrap();
    assert_eq!(request.request.input, open.id.to_string());
    assert_eq!(request.request.action, "action-update-card@1.0.0");

    // The update left an event on the card's timeline.
    let updates = events_of(ctx, types::UPDATE, &open);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].name.as_deref(), Some("flagged"));
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_idempotent_write_has_no_side_effects(ctx: &TestContext) {
    let card = ctx.card("card-steady", json!({ "count": 1 })).await;
    ctx.wait_idle().await;
    let enqueued = ctx.queue.enqueued_requests().len();

    let result = ctx
        .patch(&card, vec![replace_op("/data/count", json!(1))])
        .await;
    ctx.wait_idle().await;

    assert!(result.is_none());
    assert!(events_of(ctx, types::UPDATE, &card).is_empty());
    assert_eq!(ctx.queue.enqueued_requests().len(), enqueued);

    let changed = ctx
        .patch(&card, vec![replace_op("/data/count", json!(2))])
        .await
        .unwrap();
    assert_eq!(changed.data["count"], json!(2));
    assert_eq!(events_of(ctx, types::UPDATE, &card).len(), 1);
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_insert_attaches_a_create_event(ctx: &TestContext) {
    let card = ctx.card("card-timeline", json!({ "a": 1 })).await;

    let creates = events_of(ctx, types::CREATE, &card);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].data["payload"]["slug"], "card-timeline");
    assert_eq!(
        creates[0].data["actor"],
        json!(ctx.worker.system_actor().unwrap())
    );

    let link = ctx
        .wait_for_match(&json!({
            "type": "object",
            "required": ["name", "data"],
            "properties": {
                "type": { "const": types::LINK },
                "name": { "const": "is attached to" },
                "data": {
                    "type": "object",
                    "required": ["to"],
                    "properties": {
                        "to": {
                            "type": "object",
                            "properties": { "id": { "const": card.id } }
                        }
                    }
                }
            }
        }))
        .await;
    assert_eq!(link.data["from"]["id"], json!(creates[0].id));
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_marker_changes_propagate_to_the_timeline(ctx: &TestContext) {
    let card = ctx.card("card-private", json!({})).await;
    let bystander = ctx.card("card-public", json!({})).await;
    assert_eq!(events_of(ctx, types::CREATE, &card)[0].markers, Vec::<String>::new());

    let patched = ctx
        .patch(&card, vec![replace_op("/markers", json!(["org-a"]))])
        .await
        .unwrap();
    assert_eq!(patched.markers, vec!["org-a"]);

    let mut timeline = events_of(ctx, types::CREATE, &card);
    timeline.extend(events_of(ctx, types::UPDATE, &card));
    assert_eq!(timeline.len(), 2);
    for event in &timeline {
        assert_eq!(event.markers, vec!["org-a"], "event {}", event.slug);
    }

    // Only the stale create event was rewritten; the update event was
    // written with the new markers already.
    let create = &events_of(ctx, types::CREATE, &card)[0];
    assert!(create.updated_at.is_some());
    let update = &events_of(ctx, types::UPDATE, &card)[0];
    assert!(update.updated_at.is_none());

    // Other timelines are untouched.
    let untouched = events_of(ctx, types::CREATE, &bystander);
    assert_eq!(untouched.len(), 1);
    assert_eq!(untouched[0].markers, Vec::<String>::new());
    assert!(untouched[0].updated_at.is_none());
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_cascaded_requests_keep_the_first_originator(ctx: &TestContext) {
    let flag = flag_open_cards(ctx).await;
    let escalate = ctx
        .insert(
            types::TRIGGERED_ACTION,
            ContractDraft::new("triggered-action-escalate-flagged").with_data(json!({
                "filter": {
                    "type": "object",
                    "required": ["type", "data"],
                    "properties": {
                        "type": { "const": types::CARD },
                        "data": {
                            "type": "object",
                            "required": ["flagged"],
                            "properties": { "flagged": { "const": true } },
                            "not": { "required": ["escalated"] }
                        }
                    }
                },
                "action": "action-update-card@1.0.0",
                "target": { "$eval": "source.id" },
                "arguments": {
                    "reason": "escalated",
                    "patch": [{ "op": "add", "path": "/data/escalated", "value": true }]
                }
            })),
        )
        .await;

    let card = ctx.card("card-cascade", json!({ "status": "open" })).await;
    let escalated = ctx
        .wait_for_match(&json!({
            "type": "object",
            "required": ["slug", "data"],
            "properties": {
                "slug": { "const": "card-cascade" },
                "data": {
                    "type": "object",
                    "required": ["escalated"],
                    "properties": { "escalated": { "const": true } }
                }
            }
        }))
        .await;
    ctx.wait_idle().await;
    assert_eq!(escalated.id, card.id);

    let cascaded: Vec<_> = ctx
        .queue
        .enqueued_requests()
        .into_iter()
        .filter(|pending| pending.request.arguments["reason"] == "escalated")
        .collect();
    assert_eq!(cascaded.len(), 1);
    assert_eq!(cascaded[0].request.originator, Some(flag.id));
    assert_eq!(originated_by(ctx, &escalate), 0);
    assert_eq!(originated_by(ctx, &flag), 2);
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_missing_trigger_target_is_isolated(ctx: &TestContext) {
    let broken = ctx
        .insert(
            types::TRIGGERED_ACTION,
            ContractDraft::new("triggered-action-broken-target").with_data(json!({
                "filter": {
                    "type": "object",
                    "properties": { "type": { "const": types::CARD } }
                },
                "action": "action-update-card@1.0.0",
                "target": "card-that-does-not-exist@1.0.0",
                "arguments": { "reason": null, "patch": [] }
            })),
        )
        .await;
    let working = flag_open_cards(ctx).await;
    let failures = ctx.worker.side_effects().failures();

    let card = ctx.card("card-isolated", json!({ "status": "open" })).await;
    ctx.wait_idle().await;

    assert_eq!(originated_by(ctx, &broken), 0);
    assert_eq!(originated_by(ctx, &working), 1);
    assert!(ctx.worker.side_effects().failures() > failures);
    assert_eq!(ctx.reload(&card).await.data["flagged"], json!(true));
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_inactive_triggers_leave_the_registry(ctx: &TestContext) {
    let trigger = flag_open_cards(ctx).await;
    assert!(ctx.worker.triggers().iter().any(|t| t.id == trigger.id));

    ctx.patch(&trigger, vec![replace_op("/active", json!(false))])
        .await
        .unwrap();
    assert!(!ctx.worker.triggers().iter().any(|t| t.id == trigger.id));

    ctx.card("card-after-deactivation", json!({ "status": "open" }))
        .await;
    ctx.wait_idle().await;
    assert_eq!(originated_by(ctx, &trigger), 0);
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_failed_execution_is_posted(ctx: &TestContext) {
    let card = ctx.card("card-bad-arguments", json!({})).await;
    let request = reactor::ActionRequest::new(
        "action-update-card@1.0.0",
        ctx.worker.system_actor().unwrap(),
        card.id.to_string(),
        json!({ "unexpected": true }),
        LogContext::new("test"),
    );
    let pending = ctx.worker.enqueue(ctx.session(), request).await.unwrap();
    ctx.wait_idle().await;

    let event = ctx
        .queue
        .executions()
        .into_iter()
        .find(|event| event.request == pending.id)
        .unwrap();
    assert!(event.error);
    assert_eq!(event.data["name"], "InvalidArguments");
    assert_eq!(event.data["expected"], json!(true));
}

struct FailingSubscriptions {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl SubscriptionEvaluator for FailingSubscriptions {
    async fn evaluate(
        &self,
        _worker: &Worker,
        _context: &LogContext,
        _previous: Option<&Contract>,
        _current: &Contract,
    ) -> reactor::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ReactorError::NotFound("subscription".into()))
    }
}

#[tokio::test]
async fn test_subscription_failures_do_not_fail_the_commit() {
    let subscriptions = Arc::new(FailingSubscriptions {
        calls: AtomicUsize::new(0),
    });
    let ctx = {
        let subscriptions = subscriptions.clone();
        TestContext::start(move |builder| builder.subscriptions(subscriptions)).await
    };
    let failures = ctx.worker.side_effects().failures();

    let card = ctx.card("card-subscribed", json!({})).await;
    ctx.wait_idle().await;

    assert_eq!(ctx.reload(&card).await.slug, "card-subscribed");
    assert!(subscriptions.calls.load(Ordering::SeqCst) >= 1);
    assert!(ctx.worker.side_effects().failures() > failures);

    ctx.teardown().await;
}
