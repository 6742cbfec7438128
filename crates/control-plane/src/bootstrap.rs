// Service wiring
//
// Picks the queue, lock and idempotency backends (PostgreSQL when a database
// URL is configured, in-memory otherwise) and assembles the engine, the
// run-workflow handler and the queue runtime around them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conveyor_core::{
    ActionExecutor, AllowAll, ContentTypeRiskRule, EngineConfig, WorkflowEngine, WorkflowRunner,
    WorkflowStore,
};
use conveyor_durable::{
    BroadcastEventPublisher, DeadLetterManager, EventPublisher, HandlerRegistry, IdempotencyGuard,
    InMemoryIdempotencyGuard, InMemoryJobStore, InMemoryLockManager, JobProducer, JobStore,
    LockManager, PostgresIdempotencyGuard, PostgresJobStore, PostgresLockManager, QueueConfig,
    QueueRuntime, DEFAULT_IDEMPOTENCY_SWEEP_INTERVAL, DEFAULT_IDEMPOTENCY_TTL,
};
use sqlx::postgres::PgPoolOptions;

use crate::api;

const MAX_DB_CONNECTIONS: u32 = 10;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Queue, lock and idempotency backends
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub locks: Arc<dyn LockManager>,
    pub idempotency: Arc<dyn IdempotencyGuard>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            locks: Arc::new(InMemoryLockManager::new()),
            idempotency: Arc::new(InMemoryIdempotencyGuard::new()),
        }
    }

    /// Connect to PostgreSQL and apply the queue schema migrations
    pub async fn postgres(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_DB_CONNECTIONS)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;
        PostgresJobStore::migrate(&pool)
            .await
            .context("Failed to run queue migrations")?;

        Ok(Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            locks: Arc::new(PostgresLockManager::new(pool.clone())),
            idempotency: Arc::new(PostgresIdempotencyGuard::new(pool)),
        })
    }
}

/// Per-process settings used while wiring
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub lock_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub idempotency_sweep_interval: Duration,
    pub worker_id: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            idempotency_sweep_interval: DEFAULT_IDEMPOTENCY_SWEEP_INTERVAL,
            worker_id: "conveyor".to_string(),
        }
    }
}

/// Fully wired services
pub struct Services {
    pub engine: WorkflowEngine,
    pub jobs: Arc<dyn JobStore>,
    pub dlq: DeadLetterManager,
    pub runtime: QueueRuntime,
    pub events: Arc<BroadcastEventPublisher>,
}

impl Services {
    pub fn assemble(
        backends: Backends,
        workflows: Arc<dyn WorkflowStore>,
        actions: Arc<dyn ActionExecutor>,
        risk: Option<ContentTypeRiskRule>,
        queue_configs: &[QueueConfig],
        settings: &ServiceSettings,
    ) -> Self {
        let events = Arc::new(BroadcastEventPublisher::new(EVENT_CHANNEL_CAPACITY));
        let publisher: Arc<dyn EventPublisher> = events.clone();

        let producer = JobProducer::new(backends.jobs.clone(), backends.idempotency.clone())
            .with_idempotency_ttl(settings.idempotency_ttl)
            .with_queue_configs(queue_configs);

        let mut engine = WorkflowEngine::new(
            workflows,
            producer,
            backends.locks,
            Arc::new(AllowAll),
            publisher.clone(),
        )
        .with_config(EngineConfig::default().with_lock_ttl(settings.lock_ttl));
        if let Some(rule) = risk {
            tracing::info!(
                content_types = ?rule.content_types,
                mitigation_state = %rule.mitigation_state,
                "Risk routing enabled"
            );
            engine = engine.with_risk_predicate(Arc::new(rule));
        }

        let mut registry = HandlerRegistry::new();
        Arc::new(WorkflowRunner::new(engine.clone(), actions)).register(&mut registry);

        let runtime = QueueRuntime::new(
            backends.jobs.clone(),
            &registry,
            queue_configs,
            publisher.clone(),
            &settings.worker_id,
        )
        .with_idempotency_sweep(backends.idempotency, settings.idempotency_sweep_interval);
        let dlq = DeadLetterManager::new(backends.jobs.clone(), publisher);

        Self {
            engine,
            jobs: backends.jobs,
            dlq,
            runtime,
            events,
        }
    }

    pub fn workflows_state(&self) -> api::workflows::AppState {
        api::workflows::AppState::new(self.engine.clone())
    }

    pub fn queues_state(&self) -> api::queues::AppState {
        api::queues::AppState::new(self.jobs.clone(), self.dlq.clone())
    }
}
