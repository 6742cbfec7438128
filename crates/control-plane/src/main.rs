// Conveyor control plane server
// Decision: One process runs the admin API and the queue workers
// Decision: PostgreSQL backends when DATABASE_URL is set, in-memory otherwise

use std::sync::Arc;

use anyhow::{Context, Result};
use conveyor_control_plane::config::{load_queue_configs, load_workflows_config, WorkflowSeed};
use conveyor_control_plane::{
    build_router, AppConfig, Backends, HttpActionExecutor, RouterConfig, ServiceSettings, Services,
};
use conveyor_core::telemetry::{init_telemetry, TelemetryConfig};
use conveyor_core::InMemoryWorkflowStore;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - SERVICE_NAME: Service name (default: "conveyor-control-plane")
    // - RUST_LOG: Log filter (default: "conveyor_control_plane=info,conveyor_core=info,conveyor_durable=info,tower_http=info")
    // - LOG_FORMAT: "json" for structured output
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "conveyor" {
        telemetry_config = telemetry_config.with_service_name("conveyor-control-plane");
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some(
            "conveyor_control_plane=info,conveyor_core=info,conveyor_durable=info,tower_http=info"
                .to_string(),
        );
    }
    init_telemetry(telemetry_config);

    tracing::info!("conveyor-control-plane starting...");

    let config = AppConfig::from_env()?;

    let backends = match config.database_url.as_deref() {
        Some(url) => {
            let backends = Backends::postgres(url).await?;
            tracing::info!("Connected to database");
            backends
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory queue backends");
            Backends::in_memory()
        }
    };

    let queue_configs = load_queue_configs(config.queues_config.as_deref())?;
    tracing::info!(queues = queue_configs.len(), "Queue settings loaded");

    let seed = match config.workflows_config.as_deref() {
        Some(path) => load_workflows_config(path)?,
        None => WorkflowSeed::default(),
    };
    let workflows = Arc::new(InMemoryWorkflowStore::new());
    for definition in seed.definitions {
        tracing::info!(
            id = %definition.id,
            name = %definition.name,
            tenant_id = %definition.tenant_id,
            "Seeding workflow definition"
        );
        workflows.insert_definition(definition);
    }
    for content in seed.content {
        workflows.upsert_content(content);
    }

    let actions = HttpActionExecutor::new(config.integrations_url.clone())
        .context("Failed to build HTTP client")?;
    let settings = ServiceSettings {
        lock_ttl: config.lock_ttl,
        idempotency_ttl: config.idempotency_ttl,
        idempotency_sweep_interval: config.idempotency_sweep_interval,
        worker_id: config.worker_id.clone(),
    };
    let services = Services::assemble(
        backends,
        workflows,
        Arc::new(actions),
        seed.risk,
        &queue_configs,
        &settings,
    );

    services
        .runtime
        .start()
        .await
        .context("Failed to start queue workers")?;

    if !config.api_prefix.is_empty() {
        tracing::info!(prefix = %config.api_prefix, "API prefix configured");
    }
    let app = build_router(
        services.workflows_state(),
        services.queues_state(),
        &RouterConfig {
            api_prefix: config.api_prefix.clone(),
            cors_origins: config.cors_origins.clone(),
        },
    );

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("HTTP server stopped, draining queue workers");
    services
        .runtime
        .shutdown()
        .await
        .context("Queue worker shutdown failed")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
