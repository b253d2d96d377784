// NATS JetStream client for the fire queue

use crate::config::NatsConfig;
use crate::errors::QueueError;
use async_nats::jetstream::{
    consumer::PullConsumer,
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use std::time::Duration;
use tracing::{info, instrument};

/// NATS JetStream client
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsClient {
    /// Wrap an already connected client
    pub fn from_client(client: async_nats::Client, config: NatsConfig) -> Self {
        let jetstream = async_nats::jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            config,
        }
    }

    /// Connect to the NATS server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn new(config: NatsConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server");
        Ok(Self::from_client(client, config))
    }

    /// Subject filter covering every notification
    pub fn subject_filter(&self) -> String {
        format!("{}.>", self.config.subject_prefix)
    }

    /// Subject a notification's events are published on
    pub fn subject_for(&self, notification: &str) -> String {
        format!("{}.{}", self.config.subject_prefix, subject_token(notification))
    }

    /// Create the work-queue stream if it does not exist yet
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        info!(stream_name = %self.config.stream_name, "Initializing JetStream stream");

        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![self.subject_filter()],
            // Messages are removed once acknowledged
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(self.config.max_age_seconds),
            // Deduplication window for Nats-Msg-Id
            duplicate_window: Duration::from_secs(300),
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(stream_name = %self.config.stream_name, "Stream initialized");
        Ok(stream)
    }

    /// Create or get the durable pull consumer
    #[instrument(skip(self))]
    pub async fn get_or_create_consumer(&self) -> Result<PullConsumer, QueueError> {
        info!(consumer_name = %self.config.consumer_name, "Creating consumer");

        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::StreamNotFound(format!("Stream not found: {}", e)))?;

        let consumer_config = async_nats::jetstream::consumer::pull::Config {
            durable_name: Some(self.config.consumer_name.clone()),
            ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
            max_deliver: self.config.max_deliver,
            ack_wait: Duration::from_secs(300),
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&self.config.consumer_name, consumer_config)
            .await
            .map_err(|e| QueueError::ConsumerCreation(format!("Failed to create consumer: {}", e)))?;

        info!(consumer_name = %self.config.consumer_name, "Consumer ready");
        Ok(consumer)
    }

    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::HealthCheck(format!("Health check failed: {}", e)))?;

        Ok(())
    }
}

/// Make a notification name usable as a single subject token
fn subject_token(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
