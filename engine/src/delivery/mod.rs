// Delivery backends: outbound channels, one per backend name

pub mod webhook;

pub use webhook::WebhookBackend;

use crate::config::{BackendConfig, BackendKind};
use crate::errors::DeliveryError;
use crate::models::{Recipient, RenderedPayload};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// DeliveryBackend sends rendered content to one recipient
///
/// Delivery may be redelivered for the same occurrence; implementations that
/// must send at most once deduplicate on `payload.idempotency_key`.
#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, payload: &RenderedPayload) -> Result<(), DeliveryError>;
}

/// Delivery adapters keyed by backend name
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn DeliveryBackend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the adapter for `name`
    pub fn with_backend(mut self, name: impl Into<String>, backend: Arc<dyn DeliveryBackend>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    /// Build adapters from configuration
    pub fn from_configs(configs: &[BackendConfig]) -> Result<Self, DeliveryError> {
        let mut registry = Self::new();
        for config in configs {
            let backend: Arc<dyn DeliveryBackend> = match config.kind {
                BackendKind::Log => Arc::new(LogBackend::new(config.name.clone())),
                BackendKind::Webhook => {
                    let url = config.url.clone().ok_or_else(|| {
                        DeliveryError::Failed(format!("webhook backend '{}' has no url", config.name))
                    })?;
                    let mut webhook = WebhookBackend::new(url, config.timeout_seconds)?;
                    if let Some(token) = &config.bearer_token {
                        webhook = webhook.with_bearer_token(token.clone());
                    }
                    Arc::new(webhook)
                }
            };
            registry = registry.with_backend(config.name.clone(), backend);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeliveryBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

/// Backend that records each delivery as a structured log line
#[derive(Debug, Clone)]
pub struct LogBackend {
    name: String,
}

impl LogBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DeliveryBackend for LogBackend {
    async fn deliver(&self, recipient: &Recipient, payload: &RenderedPayload) -> Result<(), DeliveryError> {
        info!(
            backend = %self.name,
            notification = %payload.notification,
            recipient_id = %recipient.id,
            template_id = %payload.template_id,
            idempotency_key = %payload.idempotency_key,
            body = %payload.body,
            "Notification delivered"
        );
        Ok(())
    }
}

/// A delivery captured by [`RecordingBackend`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDelivery {
    pub recipient: Recipient,
    pub payload: RenderedPayload,
}

/// In-memory backend that captures deliveries
///
/// Deliveries to recipients marked with `failing_for` are rejected and not
/// captured.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    deliveries: Mutex<Vec<RecordedDelivery>>,
    failing: HashSet<String>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, recipient_id: impl Into<String>) -> Self {
        self.failing.insert(recipient_id.into());
        self
    }

    pub async fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.deliveries.lock().await.len()
    }
}

#[async_trait]
impl DeliveryBackend for RecordingBackend {
    async fn deliver(&self, recipient: &Recipient, payload: &RenderedPayload) -> Result<(), DeliveryError> {
        if self.failing.contains(&recipient.id) {
            return Err(DeliveryError::Rejected {
                status: 503,
                reason: format!("recipient {} unavailable", recipient.id),
            });
        }

        self.deliveries.lock().await.push(RecordedDelivery {
            recipient: recipient.clone(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> RenderedPayload {
        RenderedPayload {
            notification: "welcome".to_string(),
            backend: "log".to_string(),
            template_id: "welcome.txt".to_string(),
            body: "hello".to_string(),
            idempotency_key: "k".to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_backend_always_succeeds() {
        let backend = LogBackend::new("log");
        assert!(backend.deliver(&Recipient::new("u1"), &payload()).await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_backend_captures_and_fails() {
        let backend = RecordingBackend::new().failing_for("u2");
        backend.deliver(&Recipient::new("u1"), &payload()).await.unwrap();
        let err = backend
            .deliver(&Recipient::new("u2"), &payload())
            .await
            .unwrap_err();

        assert!(matches!(err, DeliveryError::Rejected { status: 503, .. }));
        assert_eq!(backend.count().await, 1);
        assert_eq!(backend.deliveries().await[0].recipient.id, "u1");
    }

    #[test]
    fn test_registry_from_configs() {
        let configs = vec![
            BackendConfig {
                name: "log".to_string(),
                kind: BackendKind::Log,
                url: None,
                timeout_seconds: 10,
                bearer_token: None,
            },
            BackendConfig {
                name: "hooks".to_string(),
                kind: BackendKind::Webhook,
                url: Some("http://localhost:9000/notify".to_string()),
                timeout_seconds: 5,
                bearer_token: Some("secret".to_string()),
            },
        ];

        let registry = BackendRegistry::from_configs(&configs).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["hooks", "log"]);
        assert!(registry.get("log").is_some());
        assert!(!registry.contains("sms"));
    }

    #[test]
    fn test_webhook_config_without_url_is_rejected() {
        let configs = vec![BackendConfig {
            name: "hooks".to_string(),
            kind: BackendKind::Webhook,
            url: None,
            timeout_seconds: 5,
            bearer_token: None,
        }];
        assert!(BackendRegistry::from_configs(&configs).is_err());
    }
}
