// In-memory fire queue
//
// Jobs wait in process memory until `take_due` hands them out. Events with an
// id that is already pending are collapsed into the pending job.

use super::{arm_recurring, FireQueue};
use crate::errors::QueueError;
use crate::models::{FireEvent, JobHandle};
use crate::trigger::RecurrenceRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// A job waiting in the in-memory queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub handle: JobHandle,
    pub event: FireEvent,
}

#[derive(Debug, Default)]
pub struct InMemoryQueue {
    jobs: Mutex<Vec<QueuedJob>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, event: FireEvent, at: DateTime<Utc>, recurring: bool) -> JobHandle {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.iter().find(|j| j.event.event_id == event.event_id) {
            debug!(event_id = %event.event_id, "Duplicate event collapsed into pending job");
            return existing.handle.clone();
        }

        let handle = JobHandle {
            id: event.event_id.clone(),
            fire_at: at,
            recurring,
        };
        jobs.push(QueuedJob {
            handle: handle.clone(),
            event,
        });
        handle
    }

    /// Remove and return every job due at `now`, earliest first
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<FireEvent> {
        let mut jobs = self.jobs.lock().await;
        let (mut due, pending): (Vec<QueuedJob>, Vec<QueuedJob>) =
            jobs.drain(..).partition(|j| j.handle.fire_at <= now);
        *jobs = pending;

        due.sort_by(|a, b| a.handle.fire_at.cmp(&b.handle.fire_at));
        due.into_iter().map(|j| j.event).collect()
    }

    /// Snapshot of pending jobs
    pub async fn pending(&self) -> Vec<QueuedJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

#[async_trait]
impl FireQueue for InMemoryQueue {
    #[instrument(skip(self, event), fields(event_id = %event.event_id, notification = %event.notification))]
    async fn enqueue(&self, event: FireEvent, at: DateTime<Utc>) -> Result<JobHandle, QueueError> {
        Ok(self.push(event, at, false).await)
    }

    #[instrument(skip(self, event, rule), fields(event_id = %event.event_id, notification = %event.notification))]
    async fn enqueue_recurring(
        &self,
        event: FireEvent,
        rule: RecurrenceRule,
    ) -> Result<JobHandle, QueueError> {
        let event = arm_recurring(event, rule, Utc::now())?;
        let at = event.fire_at.unwrap_or_else(Utc::now);
        Ok(self.push(event, at, true).await)
    }
}
