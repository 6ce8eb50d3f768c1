//! Hook for subscription-style consumers of committed contracts.

use async_trait::async_trait;

use crate::contract::{Contract, LogContext};
use crate::error::Result;
use crate::worker::Worker;

/// Evaluated in the background after every meaningful commit.
#[async_trait]
pub trait SubscriptionEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        worker: &Worker,
        context: &LogContext,
        previous: Option<&Contract>,
        current: &Contract,
    ) -> Result<()>;
}

/// Default evaluator: nothing is subscribed.
pub struct NoSubscriptions;

#[async_trait]
impl SubscriptionEvaluator for NoSubscriptions {
    async fn evaluate(
        &self,
        _worker: &Worker,
        _context: &LogContext,
        _previous: Option<&Contract>,
        _current: &Contract,
    ) -> Result<()> {
        Ok(())
    }
}
