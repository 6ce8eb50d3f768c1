//! Queue trait connecting producers of action requests to workers.

use async_trait::async_trait;
use uuid::Uuid;

use crate::contract::{ActionRequest, ActionResult, ExecutionEvent, LogContext, PendingRequest};
use crate::error::Result;

#[async_trait]
pub trait ActionQueue: Send + Sync {
    /// Accept a request for later execution.
    async fn enqueue(
        &self,
        worker_id: &str,
        session: &str,
        request: ActionRequest,
    ) -> Result<PendingRequest>;

    /// Take the next pending request, if any, without blocking.
    async fn dequeue(&self) -> Result<Option<PendingRequest>>;

    /// Wait until a result has been posted for `pending`.
    async fn wait_results(
        &self,
        context: &LogContext,
        pending: &PendingRequest,
    ) -> Result<ActionResult>;

    /// Most recent execution whose originator is `trigger_id`.
    async fn last_execution_event(
        &self,
        context: &LogContext,
        trigger_id: Uuid,
    ) -> Result<Option<ExecutionEvent>>;

    /// Record the result of an executed request.
    async fn post_results(
        &self,
        worker_id: &str,
        context: &LogContext,
        pending: &PendingRequest,
        result: &ActionResult,
    ) -> Result<ExecutionEvent>;
}
