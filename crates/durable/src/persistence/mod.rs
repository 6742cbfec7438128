//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`JobStore`] trait for queue, dead-letter and worker persistence
//! - [`InMemoryJobStore`] for testing
//! - [`PostgresJobStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{
    DeadLetterEntry, DlqFilter, FailureOutcome, JobStore, Pagination, QueueStats, StoreError,
    WorkerInfo,
};
