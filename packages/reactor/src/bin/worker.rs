//! Reactor Worker
//!
//! Runs a reactor worker over the in-memory store and queue until Ctrl-C.
//! Contracts listed in `REACTOR_SEED_PATH` (a JSON array) are replaced into
//! the store after initialisation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use reactor::{
    ContractDraft, LogContext, MemoryQueue, MemoryStore, Worker, WorkerConfig, WriteOptions,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn seed(worker: &Worker, path: &Path) -> Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;
    let drafts: Vec<ContractDraft> =
        serde_json::from_str(&raw).context("Seed file must be a JSON array of contracts")?;

    let context = LogContext::new("seed");
    let options = WriteOptions {
        actor: Some(worker.system_actor()?),
        ..Default::default()
    };

    let mut seeded = 0;
    for draft in drafts {
        let type_ref = draft
            .type_
            .clone()
            .with_context(|| format!("Seed contract {:?} has no type", draft.slug))?;
        let type_contract = worker.type_contract(&type_ref).await?;
        worker
            .replace(&context, worker.session(), &type_contract, options.clone(), draft)
            .await?;
        seeded += 1;
    }
    Ok(seeded)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reactor=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    let seed_path = config.seed_path.clone();

    let worker = Worker::builder(Arc::new(MemoryStore::new()), Arc::new(MemoryQueue::new()))
        .config(config)
        .build();
    worker
        .initialize()
        .await
        .context("Failed to initialize worker")?;

    if let Some(path) = seed_path {
        let seeded = seed(&worker, &path).await?;
        tracing::info!(path = %path.display(), seeded, "Seeded contracts");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
        });
    }

    worker.run(shutdown).await?;
    Ok(())
}
