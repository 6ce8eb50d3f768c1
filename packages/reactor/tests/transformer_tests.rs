//! Integration tests for transformer evaluation through the worker loop.

mod common;

use common::*;
use reactor::{types, Contract};
use serde_json::{json, Value};
use test_context::test_context;

fn ready_filter() -> Value {
    json!({
        "type": "object",
        "required": ["type", "data"],
        "properties": {
            "type": { "const": types::CARD },
            "data": {
                "type": "object",
                "required": ["ready"],
                "properties": { "ready": { "const": true } }
            }
        }
    })
}

/// A transformer owned by a freshly created user.
async fn owned_transformer(ctx: &TestContext, slug: &str, input_filter: Value) -> (Contract, Contract) {
    let owner = ctx.user(&format!("user-owner-of-{}", slug)).await;
    let transformer = ctx.transformer(slug, input_filter).await;
    ctx.link(&owner, "owns", "is owned by", &transformer).await;
    (owner, transformer)
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_end_to_end_transformer_scenario(ctx: &TestContext) {
    let (owner, transformer) =
        owned_transformer(ctx, "transformer-any", json!({ "type": "object" })).await;

    let entity = ctx
        .card(
            "card-artifact",
            json!({ "$transformer": { "artifactReady": false } }),
        )
        .await;
    ctx.wait_idle().await;
    assert!(ctx.tasks_of(&transformer).is_empty());

    ctx.patch(
        &entity,
        vec![replace_op("/data/$transformer/artifactReady", json!(true))],
    )
    .await
    .unwrap();
    ctx.wait_idle().await;

    let tasks = ctx.tasks_of(&transformer);
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.data["status"], "pending");
    assert_eq!(task.data["actor"], json!(owner.id));
    assert_eq!(task.data["input"]["id"], json!(entity.id));

    let generated: Vec<Contract> = ctx
        .store
        .contracts_of_type(types::LINK)
        .into_iter()
        .filter(|link| link.name.as_deref() == Some("generated"))
        .collect();
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].data["inverseName"], "was generated by");
    assert_eq!(generated[0].data["from"]["id"], json!(transformer.id));
    assert_eq!(generated[0].data["to"]["id"], json!(task.id));
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_transformer_fires_when_filter_starts_matching(ctx: &TestContext) {
    let (_, transformer) = owned_transformer(ctx, "transformer-ready", ready_filter()).await;

    let card = ctx.card("card-not-ready", json!({ "ready": false })).await;
    ctx.wait_idle().await;
    assert!(ctx.tasks_of(&transformer).is_empty());

    let ready = ctx
        .patch(&card, vec![replace_op("/data/ready", json!(true))])
        .await
        .unwrap();
    ctx.wait_idle().await;
    assert_eq!(ctx.tasks_of(&transformer).len(), 1);

    // Still matching: no second task.
    ctx.patch(&ready, vec![add_op("/data/note", json!("unrelated"))])
        .await
        .unwrap();
    ctx.wait_idle().await;
    assert_eq!(ctx.tasks_of(&transformer).len(), 1);
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_readiness_transitions_rerun_matching_transformers(ctx: &TestContext) {
    let (_, transformer) = owned_transformer(ctx, "transformer-versions", ready_filter()).await;

    let card = ctx
        .card(
            "card-versioned-artifact",
            json!({ "ready": true, "$transformer": { "artifactReady": "v1" } }),
        )
        .await;
    ctx.wait_idle().await;
    assert_eq!(ctx.tasks_of(&transformer).len(), 1);

    // A different truthy marker counts as a new artifact.
    let card = ctx
        .patch(
            &card,
            vec![replace_op("/data/$transformer/artifactReady", json!("v2"))],
        )
        .await
        .unwrap();
    ctx.wait_idle().await;
    assert_eq!(ctx.tasks_of(&transformer).len(), 2);

    // Explicitly not ready: never fires.
    ctx.patch(
        &card,
        vec![replace_op("/data/$transformer/artifactReady", json!(false))],
    )
    .await
    .unwrap();
    ctx.wait_idle().await;
    assert_eq!(ctx.tasks_of(&transformer).len(), 2);
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_ownerless_transformer_never_spawns_tasks(ctx: &TestContext) {
    let transformer = ctx.transformer("transformer-orphan", ready_filter()).await;

    let card = ctx.card("card-orphan-input", json!({ "ready": false })).await;
    ctx.patch(&card, vec![replace_op("/data/ready", json!(true))])
        .await
        .unwrap();
    ctx.wait_idle().await;

    assert!(ctx.tasks_of(&transformer).is_empty());
    assert!(ctx.store.contracts_of_type(types::TASK).is_empty());
}

#[test_context(TestContext)]
#[tokio::test]
async fn test_repository_owner_runs_the_transformer(ctx: &TestContext) {
    let owner = ctx.user("user-repository-owner").await;
    let transformer = ctx.transformer("transformer-in-repo", ready_filter()).await;
    let repository = ctx
        .insert(
            types::CONTRACT_REPOSITORY,
            reactor::ContractDraft::new("contract-repository-transformer-in-repo")
                .with_data(json!({ "base_slug": "transformer-in-repo" })),
        )
        .await;
    ctx.link(&owner, "owns", "is owned by", &repository).await;

    ctx.card("card-for-repo", json!({ "ready": true })).await;
    ctx.wait_idle().await;

    let tasks = ctx.tasks_of(&transformer);
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].data["actor"], json!(owner.id));
}
