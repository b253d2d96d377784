// Fire queue: deferred execution of fire events
//
// The in-memory queue backs tests and single-process setups; the NATS
// JetStream adapter is used by the worker.

pub mod consumer;
pub mod memory;
pub mod nats;
pub mod publisher;

pub use consumer::{FireConsumer, FireHandler, NatsFireConsumer};
pub use memory::{InMemoryQueue, QueuedJob};
pub use nats::NatsClient;
pub use publisher::NatsFireQueue;

use crate::errors::{QueueError, TriggerError};
use crate::models::{FireEvent, JobHandle};
use crate::trigger::RecurrenceRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// FireQueue hands fire events to durable, delayed execution
///
/// Delivery to the fire callback is at-least-once, at or after the requested
/// instant, with the event passed back unchanged.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FireQueue: Send + Sync {
    /// Queue a one-off fire at `at`
    async fn enqueue(&self, event: FireEvent, at: DateTime<Utc>) -> Result<JobHandle, QueueError>;

    /// Queue the next occurrence of a recurring fire
    ///
    /// The occurrence is `event.fire_at` when set, otherwise the first
    /// occurrence of `rule` after now.
    async fn enqueue_recurring(
        &self,
        event: FireEvent,
        rule: RecurrenceRule,
    ) -> Result<JobHandle, QueueError>;
}

/// Attach `rule` to `event` and pin it to the occurrence it should fire at
pub fn arm_recurring(
    event: FireEvent,
    rule: RecurrenceRule,
    now: DateTime<Utc>,
) -> Result<FireEvent, QueueError> {
    match event.fire_at {
        Some(_) => Ok(event.with_recurrence(rule)),
        None => {
            let first = rule
                .next_after(now)?
                .ok_or_else(|| TriggerError::NoNextOccurrence {
                    expression: rule.expression.clone(),
                })?;
            Ok(event.with_recurrence(rule).next_occurrence(first))
        }
    }
}
