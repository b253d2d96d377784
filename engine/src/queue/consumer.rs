// Fire event consumer for NATS JetStream

use crate::errors::{NotificationError, QueueError};
use crate::models::FireEvent;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::{AckKind, Message};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

/// Consumer loop contract
#[async_trait::async_trait]
pub trait FireConsumer: Send + Sync {
    /// Consume events until shutdown is requested
    async fn start(&self) -> Result<(), QueueError>;

    /// Request graceful shutdown
    fn shutdown(&self);
}

/// Callback invoked for every due fire event
pub type FireHandler = Arc<
    dyn Fn(FireEvent) -> futures::future::BoxFuture<'static, Result<(), NotificationError>>
        + Send
        + Sync,
>;

/// What to do with a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Fired; remove from the stream
    Ack,
    /// Redeliver after the delay
    Redeliver(Duration),
    /// Never redeliver
    Terminate,
}

/// How long a not-yet-due event is held back, capped at `max_hold`
pub fn hold_back(event: &FireEvent, now: DateTime<Utc>, max_hold: Duration) -> Option<Duration> {
    let fire_at = event.fire_at?;
    if fire_at <= now {
        return None;
    }
    let remaining = (fire_at - now).to_std().unwrap_or(max_hold);
    Some(remaining.min(max_hold))
}

/// Decode a fire event from its wire payload
pub fn decode_event(payload: &[u8]) -> Result<FireEvent, QueueError> {
    serde_json::from_slice(payload).map_err(|e| QueueError::DeserializationFailed(e.to_string()))
}

/// Map a fire outcome onto a message disposition
pub fn disposition_for(result: &Result<(), NotificationError>, retry_delay: Duration) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(e) if e.is_retryable() => Disposition::Redeliver(retry_delay),
        Err(_) => Disposition::Terminate,
    }
}

/// JetStream consumer that fires due events
pub struct NatsFireConsumer {
    consumer: PullConsumer,
    handler: FireHandler,
    max_hold: Duration,
    retry_delay: Duration,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl NatsFireConsumer {
    #[instrument(skip(client, handler))]
    pub async fn new(client: &NatsClient, handler: FireHandler) -> Result<Self, QueueError> {
        info!("Creating NATS fire consumer");

        let consumer = client.get_or_create_consumer().await?;
        let config = client.config();

        Ok(Self {
            consumer,
            handler,
            max_hold: Duration::from_secs(config.max_hold_seconds),
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    #[instrument(skip(self, message), fields(
        stream_sequence = ?message.info().map(|i| i.stream_sequence).ok(),
    ))]
    async fn process_message(&self, message: Message) -> Result<(), QueueError> {
        let disposition = match decode_event(&message.payload) {
            Err(e) => {
                error!(error = %e, "Discarding undecodable fire event");
                Disposition::Terminate
            }
            Ok(event) => match hold_back(&event, Utc::now(), self.max_hold) {
                Some(delay) => Disposition::Redeliver(delay),
                None => {
                    info!(
                        event_id = %event.event_id,
                        notification = %event.notification,
                        "Firing queued event"
                    );
                    let event_id = event.event_id.clone();
                    let result = (self.handler)(event).await;
                    if let Err(e) = &result {
                        error!(event_id = %event_id, error = %e, "Fire failed");
                    }
                    disposition_for(&result, self.retry_delay)
                }
            },
        };

        let ack = match &disposition {
            Disposition::Ack => AckKind::Ack,
            Disposition::Redeliver(delay) => AckKind::Nak(Some(*delay)),
            Disposition::Terminate => AckKind::Term,
        };

        message
            .ack_with(ack)
            .await
            .map_err(|e| QueueError::AckFailed(format!("Failed to acknowledge message: {}", e)))?;

        if let Disposition::Terminate = disposition {
            warn!("Message terminated; it will not be redelivered");
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl FireConsumer for NatsFireConsumer {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), QueueError> {
        info!("Starting fire consumer");

        let mut messages = self.consumer.messages().await.map_err(|e| {
            QueueError::ConsumeFailed(format!("Failed to create message stream: {}", e))
        })?;

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping consumer");
                break;
            }

            tokio::select! {
                message_result = messages.next() => {
                    match message_result {
                        Some(Ok(message)) => {
                            if let Err(e) = self.process_message(message).await {
                                error!(error = %e, "Failed to process message");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Error receiving message");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        None => {
                            warn!("Message stream ended unexpectedly");
                            break;
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    info!("Shutdown notification received");
                    break;
                }
                // Periodic wake-up to re-check the shutdown flag
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    continue;
                }
            }
        }

        info!("Consumer stopped gracefully");
        Ok(())
    }

    fn shutdown(&self) {
        info!("Requesting consumer shutdown");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DirectoryError;
    use crate::models::Context;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_due_event_is_not_held() {
        let now = Utc::now();
        let event = FireEvent::new("n", Context::new(), None, Some(now - ChronoDuration::seconds(1)));
        assert_eq!(hold_back(&event, now, Duration::from_secs(3600)), None);

        let unscheduled = FireEvent::new("n", Context::new(), None, None);
        assert_eq!(hold_back(&unscheduled, now, Duration::from_secs(3600)), None);
    }

    #[test]
    fn test_future_event_is_held_until_due() {
        let now = Utc::now();
        let event = FireEvent::new("n", Context::new(), None, Some(now + ChronoDuration::seconds(90)));
        assert_eq!(
            hold_back(&event, now, Duration::from_secs(3600)),
            Some(Duration::from_secs(90))
        );
    }

    #[test]
    fn test_hold_is_capped() {
        let now = Utc::now();
        let event = FireEvent::new("n", Context::new(), None, Some(now + ChronoDuration::days(3)));
        assert_eq!(
            hold_back(&event, now, Duration::from_secs(3600)),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_disposition_for_outcomes() {
        let retry = Duration::from_secs(30);
        assert_eq!(disposition_for(&Ok(()), retry), Disposition::Ack);

        let transient = Err(NotificationError::Directory(DirectoryError::Unavailable(
            "down".to_string(),
        )));
        assert_eq!(disposition_for(&transient, retry), Disposition::Redeliver(retry));

        let permanent = Err(NotificationError::UnknownNotification("gone".to_string()));
        assert_eq!(disposition_for(&permanent, retry), Disposition::Terminate);

        let refused = Err(NotificationError::ScopeFilter("opted out".to_string()));
        assert_eq!(disposition_for(&refused, retry), Disposition::Terminate);
    }

    #[test]
    fn test_decode_event() {
        let event = FireEvent::new("n", Context::new(), None, None);
        let payload = serde_json::to_vec(&event).unwrap();
        assert_eq!(decode_event(&payload).unwrap(), event);

        let garbage = decode_event(b"{not json");
        assert!(matches!(garbage, Err(QueueError::DeserializationFailed(_))));
    }
}
