// Worker binary entry point
//
// Loads notification definitions, wires the dispatcher to the NATS fire queue
// and fires queued events until Ctrl+C.

use anyhow::Result;
use engine::config::{DirectorySource, Settings};
use engine::db::DbPool;
use engine::delivery::BackendRegistry;
use engine::directory::postgres::PgUserDirectory;
use engine::directory::{InMemoryDirectory, UserDirectory};
use engine::dispatcher::Dispatcher;
use engine::errors::NotificationError;
use engine::models::FireEvent;
use engine::queue::{FireConsumer, FireHandler, NatsClient, NatsFireConsumer, NatsFireQueue};
use engine::registry::NotificationRegistry;
use engine::render::TeraRenderer;
use engine::telemetry;
use futures::FutureExt;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!("Starting notification worker");

    // Definitions are fixed for the lifetime of the process
    let mut registry = NotificationRegistry::builder();
    let count = registry
        .load_file(&settings.notifications.definitions_path)
        .map_err(|e| {
            error!(error = %e, "Failed to load notification definitions");
            anyhow::anyhow!("Definition error: {}", e)
        })?;
    let registry = Arc::new(registry.build());
    info!(count = count, "Notification definitions registered");

    let renderer = TeraRenderer::from_dir(&settings.templates.dir).map_err(|e| {
        error!(error = %e, "Failed to load templates");
        anyhow::anyhow!("Template error: {}", e)
    })?;
    info!(templates = renderer.len(), dir = %settings.templates.dir, "Templates loaded");

    let backends = BackendRegistry::from_configs(&settings.backends)
        .map_err(|e| anyhow::anyhow!("Backend configuration error: {}", e))?;

    let (directory, db_pool) = build_directory(&settings).await?;

    let nats_client = NatsClient::new(settings.nats.clone()).await.map_err(|e| {
        error!(error = %e, "Failed to initialize NATS client");
        anyhow::anyhow!("NATS initialization error: {}", e)
    })?;
    nats_client.initialize_stream().await?;
    let nats_client = Arc::new(nats_client);
    info!("NATS client initialized");

    let queue = Arc::new(NatsFireQueue::new(nats_client.clone()));
    let dispatcher = Arc::new(
        Dispatcher::new(
            registry,
            directory,
            Arc::new(renderer),
            backends,
            queue,
            settings.dispatch.clone(),
        )
        .map_err(|e| {
            error!(error = %e, "Dispatcher configuration is inconsistent");
            anyhow::anyhow!("Dispatcher error: {}", e)
        })?,
    );

    let handler: FireHandler = Arc::new(move |event: FireEvent| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let report = dispatcher.fire_event(&event).await?;
            if !report.is_success() {
                warn!(
                    event_id = %report.event_id,
                    failed = report.failures.len(),
                    "Fire completed with failed deliveries"
                );
            }
            Ok::<(), NotificationError>(())
        }
        .boxed()
    });

    let consumer = Arc::new(NatsFireConsumer::new(&nats_client, handler).await?);
    let consumer_task = consumer.clone();
    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer_task.start().await {
            error!(error = %e, "Fire consumer error");
        }
    });

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    consumer.shutdown();
    info!("Waiting for in-flight fires to complete");
    let _ = consumer_handle.await;

    if let Some(pool) = db_pool {
        pool.close().await;
    }
    telemetry::shutdown_tracer();

    info!("Worker shutdown complete");
    Ok(())
}

async fn build_directory(settings: &Settings) -> Result<(Arc<dyn UserDirectory>, Option<DbPool>)> {
    match settings.directory.source {
        DirectorySource::Postgres => {
            let pool = DbPool::new(&settings.database).await.map_err(|e| {
                error!(error = %e, "Failed to initialize database pool");
                anyhow::anyhow!("Database initialization error: {}", e)
            })?;

            if settings.directory.run_migrations {
                pool.migrate(&settings.directory.migrations_path).await?;
                info!("Migrations applied");
            }

            let directory: Arc<dyn UserDirectory> = Arc::new(PgUserDirectory::new(pool.clone()));
            Ok((directory, Some(pool)))
        }
        DirectorySource::Memory => {
            let directory = match &settings.directory.recipients_path {
                Some(path) => InMemoryDirectory::from_json_file(path)?,
                None => {
                    warn!("In-memory directory has no recipients_path; starting empty");
                    InMemoryDirectory::default()
                }
            };
            Ok((Arc::new(directory), None))
        }
    }
}
