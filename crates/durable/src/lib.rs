//! # Conveyor durable queue
//!
//! Reliable named job queues with at-least-once delivery, plus the
//! coordination primitives workflow execution relies on.
//!
//! ## Features
//!
//! - **Idempotent submission**: keyed jobs are recorded once per TTL window
//! - **Bounded retries**: fixed or exponential backoff, then dead-lettering
//! - **Dead-letter recovery**: list, inspect, replay and purge exhausted jobs
//! - **Instance locks**: TTL'd compare-and-set locks with heartbeat extension
//! - **Lifecycle events**: best-effort fan-out of job events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │   JobProducer  ──(IdempotencyGuard)──►  JobStore             │
//! │                                          │                   │
//! │   QueueRuntime ─► QueueWorker ◄──claim───┘                   │
//! │                      │ handler (HandlerRegistry)             │
//! │                      ├─ ok    ─► complete_job                │
//! │                      └─ error ─► fail_job ─► retry | DLQ     │
//! │                                                              │
//! │   DeadLetterManager ─► list / replay / purge                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_durable::prelude::*;
//!
//! let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
//! let producer = JobProducer::new(store.clone(), Arc::new(InMemoryIdempotencyGuard::new()));
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("email:send", |job| async move { Ok(job.payload) });
//!
//! let runtime = QueueRuntime::new(store, &registry, &default_queues(), publisher, "node-1");
//! runtime.start().await?;
//!
//! producer
//!     .enqueue("email:send", "welcome", json!({"to": "a@b.c"}), JobOptions::default())
//!     .await?;
//! ```

pub mod dlq;
pub mod events;
pub mod idempotency;
pub mod job;
pub mod lock;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod worker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::dlq::{DeadLetterManager, DlqError, ReplayBatchResult};
    pub use crate::events::{
        BroadcastEventPublisher, EventEnvelope, EventPublisher, NoopEventPublisher,
    };
    pub use crate::idempotency::{IdempotencyGuard, InMemoryIdempotencyGuard};
    pub use crate::job::{Job, JobError, JobOptions, JobState};
    pub use crate::lock::{HeldLock, InMemoryLockManager, LockManager};
    pub use crate::persistence::{InMemoryJobStore, JobStore, StoreError};
    pub use crate::queue::{default_queues, HandlerRegistry, JobProducer, QueueConfig};
    pub use crate::reliability::Backoff;
    pub use crate::worker::{QueueRuntime, QueueWorker};
}

pub use dlq::{DeadLetterManager, DlqError, ReplayBatchResult, ReplayFailure};
pub use events::{
    publish_best_effort, queue_channel, workflow_channel, BroadcastEventPublisher, EventEnvelope,
    EventPublisher, NoopEventPublisher, PublishError,
};
pub use idempotency::{
    IdempotencyError, IdempotencyGuard, InMemoryIdempotencyGuard, PostgresIdempotencyGuard,
    DEFAULT_IDEMPOTENCY_SWEEP_INTERVAL, DEFAULT_IDEMPOTENCY_TTL,
};
pub use job::{EnvelopeOptions, Job, JobEnvelope, JobError, JobOptions, JobState};
pub use lock::{
    instance_lock_key, HeldLock, InMemoryLockManager, LockError, LockLease, LockManager,
    PostgresLockManager,
};
pub use persistence::{
    DeadLetterEntry, DlqFilter, FailureOutcome, InMemoryJobStore, JobStore, Pagination,
    PostgresJobStore, QueueStats, StoreError, WorkerInfo,
};
pub use queue::{
    default_queues, dlq_name, HandlerRegistry, JobHandler, JobProducer, JobResult, QueueConfig,
    QueueError, WORKFLOW_RUN_QUEUE,
};
pub use reliability::{Backoff, BackoffKind, RateLimiter, RateLimiterConfig};
pub use worker::{JobPoller, PollerConfig, QueueRuntime, QueueWorker, WorkerError, WorkerStatus};
