//! Test harness running a real worker loop over the in-memory store and queue.
//!
//! Each test gets a fresh store, queue and initialized worker. The worker
//! loop runs in the background until teardown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reactor::{
    ContractStore, LogContext, MemoryQueue, MemoryStore, QueryOptions, Worker, WorkerBuilder,
    WorkerConfig,
};
use serde_json::Value;
use test_context::AsyncTestContext;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long polling helpers wait before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// Running worker plus direct handles to its collaborators.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryQueue>,
    pub worker: Worker,
    pub context: LogContext,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl AsyncTestContext for TestContext {
    async fn setup() -> Self {
        Self::start(|builder| builder).await
    }

    async fn teardown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

impl TestContext {
    /// Start a worker, letting the caller adjust the builder first.
    pub async fn start(configure: impl FnOnce(WorkerBuilder) -> WorkerBuilder) -> Self {
        // Run tests with: RUST_LOG=reactor=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let config = WorkerConfig {
            tick_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(5),
            ..WorkerConfig::with_worker_id("worker-test")
        };
        let worker = configure(
            Worker::builder(store.clone(), queue.clone())
                .config(config)
                .session("session-test"),
        )
        .build();
        worker
            .initialize()
            .await
            .expect("Failed to initialize worker");

        let shutdown = CancellationToken::new();
        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker
                    .run(shutdown)
                    .await
                    .expect("Worker loop failed");
            })
        };

        Self {
            store,
            queue,
            worker,
            context: LogContext::new("test"),
            shutdown,
            handle,
        }
    }

    pub fn session(&self) -> &str {
        self.worker.session()
    }

    /// Poll the store until `schema` matches a contract.
    pub async fn wait_for_match(&self, schema: &Value) -> reactor::Contract {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let found = self
                .store
                .query(schema, QueryOptions::limit(1))
                .await
                .expect("Query failed");
            if let Some(contract) = found.into_iter().next() {
                return contract;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for a contract matching {}",
                schema
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// Wait until every enqueued request has been executed and every
    /// background side effect has finished.
    pub async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            self.worker.settle().await;
            let enqueued = self.queue.enqueued_requests();
            let executed: HashSet<_> = self
                .queue
                .executions()
                .into_iter()
                .map(|event| event.request)
                .collect();
            if enqueued.iter().all(|pending| executed.contains(&pending.id)) {
                self.worker.settle().await;
                if self.queue.enqueued_requests().len() == enqueued.len() {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for the worker to go idle"
            );
            tokio::time::sleep(POLL).await;
        }
    }
}
