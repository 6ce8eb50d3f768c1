//! In-memory action queue.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::contract::{ActionRequest, ActionResult, ExecutionEvent, LogContext, PendingRequest};
use crate::error::Result;
use crate::traits::queue::ActionQueue;

/// Default number of requests, executions and unclaimed results retained.
pub const DEFAULT_RETENTION: usize = 10_000;

/// FIFO queue with posted results kept in memory.
///
/// Every enqueued request is also kept in a history so tests can assert on
/// what was produced without running a worker loop. The history, the
/// execution log and unclaimed results are bounded by the retention limit,
/// oldest first. A result is dropped as soon as `wait_results` returns it.
/// The latest execution per originator is kept regardless of retention so
/// interval triggers keep their schedule.
pub struct MemoryQueue {
    retention: usize,
    pending: Mutex<VecDeque<PendingRequest>>,
    history: Mutex<VecDeque<PendingRequest>>,
    results: DashMap<Uuid, ActionResult>,
    unclaimed: Mutex<VecDeque<Uuid>>,
    executions: Mutex<VecDeque<ExecutionEvent>>,
    latest: DashMap<Uuid, ExecutionEvent>,
    posted: Notify,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

fn push_bounded<T>(log: &Mutex<VecDeque<T>>, item: T, retention: usize) -> Option<T> {
    let mut log = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    log.push_back(item);
    if log.len() > retention {
        log.pop_front()
    } else {
        None
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            pending: Mutex::default(),
            history: Mutex::default(),
            results: DashMap::new(),
            unclaimed: Mutex::default(),
            executions: Mutex::default(),
            latest: DashMap::new(),
            posted: Notify::new(),
        }
    }

    /// Retained requests, in enqueue order.
    pub fn enqueued_requests(&self) -> Vec<PendingRequest> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Number of requests waiting for a worker.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Number of posted results nobody has claimed yet.
    pub fn unclaimed_results(&self) -> usize {
        self.results.len()
    }

    /// Retained executions, in posting order.
    pub fn executions(&self) -> Vec<ExecutionEvent> {
        self.executions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Record an execution directly, as if a worker had posted it.
    pub fn record_execution(&self, event: ExecutionEvent) {
        if let Some(originator) = event.originator {
            let newer = self
                .latest
                .get(&originator)
                .map_or(true, |current| current.timestamp <= event.timestamp);
            if newer {
                self.latest.insert(originator, event.clone());
            }
        }
        push_bounded(&self.executions, event, self.retention);
    }
}

#[async_trait]
impl ActionQueue for MemoryQueue {
    async fn enqueue(
        &self,
        worker_id: &str,
        session: &str,
        request: ActionRequest,
    ) -> Result<PendingRequest> {
        let pending = PendingRequest {
            id: request.id,
            worker: worker_id.to_string(),
            session: session.to_string(),
            enqueued_at: Utc::now(),
            request,
        };

        debug!(
            request = %pending.id,
            action = %pending.request.action,
            input = %pending.request.input,
            "enqueued action request"
        );

        push_bounded(&self.history, pending.clone(), self.retention);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(pending.clone());
        Ok(pending)
    }

    async fn dequeue(&self) -> Result<Option<PendingRequest>> {
        Ok(self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front())
    }

    async fn wait_results(
        &self,
        context: &LogContext,
        pending: &PendingRequest,
    ) -> Result<ActionResult> {
        loop {
            let posted = self.posted.notified();
            if let Some((_, result)) = self.results.remove(&pending.id) {
                return Ok(result);
            }
            debug!(context = %context, request = %pending.id, "waiting for results");
            posted.await;
        }
    }

    async fn last_execution_event(
        &self,
        _context: &LogContext,
        trigger_id: Uuid,
    ) -> Result<Option<ExecutionEvent>> {
        Ok(self.latest.get(&trigger_id).map(|event| event.value().clone()))
    }

    async fn post_results(
        &self,
        worker_id: &str,
        context: &LogContext,
        pending: &PendingRequest,
        result: &ActionResult,
    ) -> Result<ExecutionEvent> {
        let event = ExecutionEvent {
            id: Uuid::new_v4(),
            request: pending.id,
            action: pending.request.action.clone(),
            worker: worker_id.to_string(),
            originator: pending.request.originator,
            timestamp: Utc::now(),
            error: result.error,
            data: result.data.clone(),
        };

        debug!(context = %context, request = %pending.id, error = result.error, "posted results");

        self.record_execution(event.clone());
        self.results.insert(pending.id, result.clone());
        if let Some(expired) = push_bounded(&self.unclaimed, pending.id, self.retention) {
            self.results.remove(&expired);
        }
        self.posted.notify_waiters();
        Ok(event)
    }
}
