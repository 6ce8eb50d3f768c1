//! Integration tests for interval triggers.

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::*;
use reactor::{types, Contract, ContractDraft, ExecutionEvent};
use serde_json::json;
use test_context::test_context;
use uuid::Uuid;

fn day_zero() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
}

async fn daily_card_trigger(ctx: &TestContext) -> Contract {
    ctx.insert(
        types::TRIGGERED_ACTION,
        ContractDraft::new("triggered-action-daily-digest").with_data(json!({
            "startDate": day_zero().to_rfc3339(),
            "interval": "P1D",
            "action": "action-create-card@1.0.0",
            "target": types::CARD,
            "arguments": {
                "reason": null,
                "properties": { "data": { "source": "interval" } }
            }
        })),
    )
    .await
}

fn executed_at(trigger: &Contract, timestamp: DateTime<Utc>) -> ExecutionEvent {
    ExecutionEvent {
        id: Uuid::new_v4(),
        request: Uuid::new_v4(),
        action: "action-create-card@1.0.0".into(),
        worker: "worker-test".into(),
        originator: Some(trigger.id),
        timestamp,
        error: false,
        data: json!(null),
    }
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_interval_waits_for_the_next_execution_date(ctx: &TestContext) {
    let trigger = daily_card_trigger(ctx).await;
    ctx.queue
        .record_execution(executed_at(&trigger, day_zero() + Duration::days(3)));

    let early = day_zero() + Duration::days(3) + Duration::hours(12);
    assert_eq!(ctx.worker.tick(ctx.session(), early).await.unwrap(), 0);

    let due = day_zero() + Duration::days(4);
    assert_eq!(ctx.worker.tick(ctx.session(), due).await.unwrap(), 1);

    let created = ctx
        .wait_for_match(&json!({
            "type": "object",
            "required": ["data"],
            "properties": {
                "type": { "const": types::CARD },
                "data": {
                    "type": "object",
                    "required": ["source"],
                    "properties": { "source": { "const": "interval" } }
                }
            }
        }))
        .await;
    assert!(created.slug.starts_with("card-"));
    ctx.wait_idle().await;

    let request = ctx
        .queue
        .enqueued_requests()
        .into_iter()
        .find(|pending| pending.request.originator == Some(trigger.id))
        .unwrap();
    assert_eq!(request.request.timestamp, due);
    assert_eq!(request.request.actor, ctx.worker.system_actor().unwrap());

    // The real execution is now the latest one, so a day later is too early.
    let next_day = day_zero() + Duration::days(5);
    assert_eq!(ctx.worker.tick(ctx.session(), next_day).await.unwrap(), 0);
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_interval_before_start_date_never_fires(ctx: &TestContext) {
    daily_card_trigger(ctx).await;

    let before = day_zero() - Duration::minutes(1);
    assert_eq!(ctx.worker.tick(ctx.session(), before).await.unwrap(), 0);
    assert_eq!(ctx.worker.tick(ctx.session(), day_zero()).await.unwrap(), 1);
    ctx.wait_idle().await;
}
