//! Isolated side effects of a commit.
//!
//! Each side effect (one trigger, the transformer run, marker propagation,
//! ...) either succeeds or is reported on its own. Nothing here returns an
//! error to the write that caused it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::contract::LogContext;
use crate::error::{ReactorError, Result};

/// What kind of side effect failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    Trigger,
    Transformer,
    Subscription,
    MarkerPropagation,
    TypeTriggers,
    RegistrySync,
    Tick,
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SideEffect::Trigger => "trigger",
            SideEffect::Transformer => "transformer",
            SideEffect::Subscription => "subscription",
            SideEffect::MarkerPropagation => "marker-propagation",
            SideEffect::TypeTriggers => "type-triggers",
            SideEffect::RegistrySync => "registry-sync",
            SideEffect::Tick => "tick",
        };
        f.write_str(name)
    }
}

/// Supervised group for best-effort work spawned by commits.
#[derive(Clone, Default)]
pub struct SideEffects {
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl SideEffects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of side effects that failed since startup.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Log a failure at the level its category calls for.
    pub fn report(
        &self,
        context: &LogContext,
        effect: SideEffect,
        input: &str,
        subject: &str,
        err: &ReactorError,
    ) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if err.is_expected() {
            warn!(
                context = %context,
                effect = %effect,
                input = %input,
                subject = %subject,
                error = %err,
                "side effect failed"
            );
        } else {
            error!(
                context = %context,
                effect = %effect,
                input = %input,
                subject = %subject,
                error = %err,
                category = %err.category(),
                "side effect failed"
            );
        }
    }

    /// Await `work` inline, reporting its failure instead of returning it.
    pub async fn isolate<T>(
        &self,
        context: &LogContext,
        effect: SideEffect,
        input: &str,
        subject: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        match work.await {
            Ok(value) => Some(value),
            Err(e) => {
                self.report(context, effect, input, subject, &e);
                None
            }
        }
    }

    /// Run `work` in the background, reporting its failure.
    pub fn spawn<F>(&self, context: LogContext, effect: SideEffect, input: String, subject: String, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let effects = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = work.await {
                effects.report(&context, effect, &input, &subject, &e);
            }
        });
    }

    /// Wait for every background side effect spawned so far.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
