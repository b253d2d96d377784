// Telemetry: structured logging, tracing export and notification metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "notification-engine";

/// Initialize JSON logging, optionally exporting spans over OTLP
///
/// `RUST_LOG` takes precedence over `log_level` when set.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");
    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the notification metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "notification_scheduled_total",
        "Schedule calls accepted, by notification and dispatch mode"
    );
    describe_counter!(
        "notification_delivered_total",
        "Successful (recipient, backend) deliveries"
    );
    describe_counter!(
        "notification_delivery_failed_total",
        "Failed (recipient, backend) deliveries, by reason"
    );
    describe_histogram!(
        "notification_fire_duration_seconds",
        "Duration of fire operations in seconds"
    );
    describe_histogram!(
        "notification_recipients",
        "Number of recipients resolved per fire"
    );

    tracing::info!(metrics_port = metrics_port, "Prometheus metrics exporter initialized");
    Ok(())
}

/// Record an accepted schedule call; `mode` is immediate, queued or recurring
#[inline]
pub fn record_scheduled(notification: &str, mode: &'static str) {
    counter!(
        "notification_scheduled_total",
        "notification" => notification.to_string(),
        "mode" => mode
    )
    .increment(1);
}

#[inline]
pub fn record_delivered(notification: &str, backend: &str) {
    counter!(
        "notification_delivered_total",
        "notification" => notification.to_string(),
        "backend" => backend.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_delivery_failed(notification: &str, backend: &str, reason: &'static str) {
    counter!(
        "notification_delivery_failed_total",
        "notification" => notification.to_string(),
        "backend" => backend.to_string(),
        "reason" => reason
    )
    .increment(1);
}

#[inline]
pub fn record_fire_duration(notification: &str, duration_seconds: f64) {
    histogram!(
        "notification_fire_duration_seconds",
        "notification" => notification.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn record_recipients(notification: &str, count: usize) {
    histogram!(
        "notification_recipients",
        "notification" => notification.to_string()
    )
    .record(count as f64);
}
