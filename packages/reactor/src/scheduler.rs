//! Interval triggers.
//!
//! Each tick looks at every registered trigger that has an `interval`, finds
//! when it last ran through the queue's execution log, and enqueues a request
//! once the next execution date has passed. Requests are never awaited.

use chrono::{DateTime, Utc};
use futures::{future, stream, StreamExt};
use tracing::{debug, info};

use crate::contract::{ActionRequest, LogContext};
use crate::error::Result;
use crate::side_effects::SideEffect;
use crate::triggers::{self, RequestOptions, TriggeredAction};
use crate::worker::Worker;

impl Worker {
    /// Evaluate interval triggers at `current_time`.
    ///
    /// Returns how many requests were enqueued. Failing triggers are logged
    /// and skipped.
    pub async fn tick(&self, session: &str, current_time: DateTime<Utc>) -> Result<usize> {
        let context = LogContext::new("tick");
        let due: Vec<TriggeredAction> = self
            .triggers()
            .iter()
            .filter(|trigger| trigger.is_interval())
            .cloned()
            .collect();
        if due.is_empty() {
            return Ok(0);
        }

        debug!(context = %context, triggers = due.len(), "evaluating interval triggers");

        let mut enqueued = 0;
        stream::iter(due)
            .map(|trigger| {
                let context = &context;
                async move {
                    let slug = trigger.slug.clone();
                    self.side_effects()
                        .isolate(
                            context,
                            SideEffect::Tick,
                            &slug,
                            &trigger.data.action,
                            self.fire_interval(context, session, &trigger, current_time),
                        )
                        .await
                }
            })
            .buffer_unordered(self.config().tick_concurrency.max(1))
            .for_each(|outcome| {
                enqueued += outcome.unwrap_or(0);
                future::ready(())
            })
            .await;

        Ok(enqueued)
    }

    async fn fire_interval(
        &self,
        context: &LogContext,
        session: &str,
        trigger: &TriggeredAction,
        current_time: DateTime<Utc>,
    ) -> Result<usize> {
        let last = self.queue().last_execution_event(context, trigger.id).await?;
        let Some(next) = triggers::next_execution_date(trigger, last.as_ref())? else {
            return Ok(0);
        };
        if current_time < next {
            return Ok(0);
        }

        let request = triggers::get_request(
            self.store().as_ref(),
            trigger,
            None,
            RequestOptions {
                mode: None,
                current_date: current_time,
                context,
            },
        )
        .await?;
        let Some(request) = request else {
            return Ok(0);
        };

        let actor = self.system_actor()?;
        for target in &request.targets {
            let derived = ActionRequest::new(
                request.action.clone(),
                actor,
                target.clone(),
                request.arguments.clone(),
                request.context.clone(),
            )
            .with_timestamp(current_time)
            .with_originator(Some(request.originator));

            info!(
                context = %context,
                trigger = %trigger.slug,
                target = %target,
                action = %derived.action,
                next = %next,
                "enqueueing action request due to interval trigger"
            );
            self.enqueue(session, derived).await?;
        }
        Ok(request.targets.len())
    }
}
