//! Named job queues
//!
//! This module provides:
//! - [`JobProducer`] - Idempotent job submission
//! - [`HandlerRegistry`] - Explicit queue → handler map
//! - [`QueueConfig`] - Per-queue concurrency, retry and rate settings

mod config;
mod producer;
mod registry;

pub use config::{default_queues, dlq_name, QueueConfig, WORKFLOW_RUN_QUEUE};
pub use producer::{JobProducer, QueueError};
pub use registry::{HandlerRegistry, JobHandler, JobResult};
