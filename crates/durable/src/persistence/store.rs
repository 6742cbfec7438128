//! JobStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Job, JobOptions};
use crate::reliability::Backoff;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found (or no longer owned by the caller)
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Dead-letter entry not found
    #[error("dead-letter entry not found: {0}")]
    DeadLetterNotFound(Uuid),

    /// Job is not in a state that allows the operation
    #[error("job {id} is {state}, expected active")]
    NotActive { id: Uuid, state: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Outcome of failing a job
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Job rescheduled after `delay`
    Retrying { attempts_made: u32, delay: Duration },

    /// Attempts exhausted; job removed from its queue and dead-lettered
    DeadLettered { entry_id: Uuid, attempts_made: u32 },
}

/// Terminal record of a job that exhausted its retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub original_queue: String,
    pub original_job_id: Uuid,
    pub job_name: String,
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    pub error: String,
    pub stack: Option<String>,
    pub error_history: Vec<String>,
    pub failed_at: DateTime<Utc>,
    /// Retry settings of the original job, restored on replay
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Option<u32>,
    pub remove_on_fail: Option<u32>,
}

impl DeadLetterEntry {
    /// Options for re-submitting the entry with a fresh attempt counter
    pub fn replay_options(&self) -> JobOptions {
        JobOptions {
            idempotency_key: None,
            attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            delay: None,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }
}

/// Filter for listing dead-letter entries
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub error_contains: Option<String>,
    pub job_id_contains: Option<String>,
}

impl DlqFilter {
    /// Check a single entry against the filter
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        if let Some(from) = self.from {
            if entry.failed_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.failed_at > to {
                return false;
            }
        }
        if let Some(ref needle) = self.error_contains {
            if !entry.error.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(ref needle) = self.job_id_contains {
            if !entry.original_job_id.to_string().contains(needle.as_str())
                && !entry.id.to_string().contains(needle.as_str())
            {
                return false;
            }
        }
        true
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Counters reported for a queue
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    /// Dead-letter entries originating from this queue
    pub failed: u64,
    pub delayed: u64,
    pub workers: u64,
    pub paused: bool,
}

/// Worker registration record
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: String,
    pub queue_name: String,
    pub concurrency: u32,
    pub current_load: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Broker interface for named job queues
///
/// Any backend with atomic claiming and visibility-timeout semantics
/// satisfies this trait. Implementations must be thread-safe.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Queue Operations
    // =========================================================================

    /// Persist a new job
    async fn add_job(&self, job: Job) -> Result<Job, StoreError>;

    /// Fetch a job by id (any state)
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Claim up to `max_jobs` claimable jobs, marking them active
    ///
    /// A claimed job is invisible to other workers until `lock_duration`
    /// elapses without an [`extend_job_lock`](Self::extend_job_lock).
    async fn claim_jobs(
        &self,
        queue_name: &str,
        worker_id: &str,
        max_jobs: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Push the visibility timeout of an active job forward
    ///
    /// Returns false when the job is no longer held by `worker_id`.
    async fn extend_job_lock(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool, StoreError>;

    /// Mark an active job completed
    async fn complete_job(&self, job_id: Uuid, result: serde_json::Value)
        -> Result<(), StoreError>;

    /// Record a failed attempt: reschedule, or dead-letter when exhausted
    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        stack: Option<&str>,
    ) -> Result<FailureOutcome, StoreError>;

    /// Return active jobs whose lock expired to the waiting set
    async fn reclaim_stalled(&self, queue_name: &str) -> Result<Vec<Uuid>, StoreError>;

    /// Queue counters
    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError>;

    /// Stop handing out jobs for a queue
    async fn pause_queue(&self, queue_name: &str) -> Result<(), StoreError>;

    /// Resume a paused queue
    async fn resume_queue(&self, queue_name: &str) -> Result<(), StoreError>;

    /// Whether a queue is paused
    async fn is_paused(&self, queue_name: &str) -> Result<bool, StoreError>;

    // =========================================================================
    // Dead Letter Queue Operations
    // =========================================================================

    /// List entries for an origin queue, newest first
    async fn list_dead_letters(
        &self,
        queue_name: &str,
        filter: &DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Fetch a single entry
    async fn get_dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Atomically re-submit an entry to its origin queue and delete it
    ///
    /// The new job starts with `attempts_made = 0`. If the insert fails
    /// the entry is left in place.
    async fn requeue_dead_letter(&self, entry_id: Uuid) -> Result<Job, StoreError>;

    /// Delete a single entry
    async fn delete_dead_letter(&self, entry_id: Uuid) -> Result<bool, StoreError>;

    /// Delete every entry for an origin queue
    async fn purge_dead_letters(&self, queue_name: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Worker Registry Operations (optional, default no-op)
    // =========================================================================

    /// Register a worker
    async fn register_worker(&self, _worker: WorkerInfo) -> Result<(), StoreError> {
        Ok(())
    }

    /// Update worker heartbeat and load
    async fn worker_heartbeat(&self, _worker_id: &str, _current_load: u32) -> Result<(), StoreError> {
        Ok(())
    }

    /// Deregister a worker
    async fn deregister_worker(&self, _worker_id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}
