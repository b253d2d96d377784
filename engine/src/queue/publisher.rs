// Fire queue publisher for NATS JetStream
//
// Events are published right away; the consumer holds back events that are
// not due yet by negatively acknowledging them with a delay.

use super::{arm_recurring, FireQueue};
use crate::errors::QueueError;
use crate::models::{FireEvent, JobHandle};
use crate::queue::nats::NatsClient;
use crate::trigger::RecurrenceRule;
use async_nats::jetstream::context::PublishAckFuture;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";
pub const NOTIFICATION_HEADER: &str = "Notification";
pub const FIRE_AT_HEADER: &str = "Fire-At";

/// FireQueue backed by a JetStream work-queue stream
pub struct NatsFireQueue {
    client: Arc<NatsClient>,
    publish_timeout: Duration,
    max_retries: u32,
}

impl NatsFireQueue {
    pub fn new(client: Arc<NatsClient>) -> Self {
        Self {
            client,
            publish_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[instrument(skip(self, event), fields(
        event_id = %event.event_id,
        notification = %event.notification,
    ))]
    async fn publish(&self, event: &FireEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(event).map_err(|e| {
            QueueError::SerializationFailed(format!("Failed to serialize fire event: {}", e))
        })?;

        let subject = self.client.subject_for(&event.notification);

        // Nats-Msg-Id lets the broker drop re-published copies of one occurrence
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, event.event_id.as_str());
        headers.insert(NOTIFICATION_HEADER, event.notification.as_str());
        if let Some(at) = event.fire_at {
            headers.insert(FIRE_AT_HEADER, at.to_rfc3339().as_str());
        }

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(ack)) => {
                if ack.duplicate {
                    info!(subject = %subject, "Fire event already queued");
                } else {
                    info!(subject = %subject, "Fire event queued");
                }
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }

    async fn publish_with_retry(&self, event: &FireEvent) -> Result<(), QueueError> {
        let mut attempt = 0;
        loop {
            match self.publish(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(100 * 2_u64.pow(attempt - 1));
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl FireQueue for NatsFireQueue {
    async fn enqueue(&self, event: FireEvent, at: DateTime<Utc>) -> Result<JobHandle, QueueError> {
        let event = pin_fire_at(event, at);
        self.publish_with_retry(&event).await?;

        Ok(JobHandle {
            id: event.event_id,
            fire_at: at,
            recurring: false,
        })
    }

    async fn enqueue_recurring(
        &self,
        event: FireEvent,
        rule: RecurrenceRule,
    ) -> Result<JobHandle, QueueError> {
        let event = arm_recurring(event, rule, Utc::now())?;
        self.publish_with_retry(&event).await?;

        Ok(JobHandle {
            fire_at: event.fire_at.unwrap_or_else(Utc::now),
            id: event.event_id,
            recurring: true,
        })
    }
}

/// The consumer reads the due instant from the event, so it must match `at`
fn pin_fire_at(event: FireEvent, at: DateTime<Utc>) -> FireEvent {
    if event.fire_at == Some(at) {
        event
    } else {
        event.next_occurrence(at)
    }
}
