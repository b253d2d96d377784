// Webhook delivery backend: one JSON POST per (recipient, backend) pair

use super::DeliveryBackend;
use crate::errors::DeliveryError;
use crate::models::{Recipient, RenderedPayload};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Header carrying the per-pair idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    notification: &'a str,
    backend: &'a str,
    template_id: &'a str,
    idempotency_key: &'a str,
    recipient: &'a Recipient,
    body: &'a str,
}

/// WebhookBackend posts rendered notifications to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookBackend {
    client: Client,
    url: String,
    bearer_token: Option<String>,
}

impl WebhookBackend {
    pub fn new(url: impl Into<String>, timeout_seconds: u64) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| DeliveryError::Failed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[async_trait]
impl DeliveryBackend for WebhookBackend {
    #[instrument(skip(self, recipient, payload), fields(url = %self.url, recipient_id = %recipient.id))]
    async fn deliver(&self, recipient: &Recipient, payload: &RenderedPayload) -> Result<(), DeliveryError> {
        let body = WebhookBody {
            notification: &payload.notification,
            backend: &payload.backend,
            template_id: &payload.template_id,
            idempotency_key: &payload.idempotency_key,
            recipient,
            body: &payload.body,
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, &payload.idempotency_key)
            .json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(e.to_string())
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }

        debug!(status = status.as_u16(), "Webhook accepted notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> RenderedPayload {
        RenderedPayload {
            notification: "welcome".to_string(),
            backend: "webhook".to_string(),
            template_id: "welcome.txt".to_string(),
            body: "hello Alice".to_string(),
            idempotency_key: "abc123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notify"))
            .and(header(IDEMPOTENCY_HEADER, "abc123"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_partial_json(serde_json::json!({
                "notification": "welcome",
                "recipient": {"id": "u1", "name": "Alice"},
                "body": "hello Alice"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let backend = WebhookBackend::new(format!("{}/notify", server.uri()), 5)
            .unwrap()
            .with_bearer_token("token-1");
        let recipient = Recipient::new("u1").with_attribute("name", "Alice");

        backend.deliver(&recipient, &payload()).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad recipient"))
            .mount(&server)
            .await;

        let backend = WebhookBackend::new(server.uri(), 5).unwrap();
        let err = backend
            .deliver(&Recipient::new("u1"), &payload())
            .await
            .unwrap_err();
        match err {
            DeliveryError::Rejected { status, reason } => {
                assert_eq!(status, 422);
                assert_eq!(reason, "bad recipient");
            }
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let backend = WebhookBackend::new(server.uri(), 1).unwrap();
        let err = backend
            .deliver(&Recipient::new("u1"), &payload())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout(_)));
    }
}
