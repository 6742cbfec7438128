//! Idempotency guard for duplicate submission suppression
//!
//! A key is "seen" for `ttl` after it is first recorded. The producer
//! consults the guard before every keyed enqueue.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::InMemoryIdempotencyGuard;
pub use postgres::PostgresIdempotencyGuard;

/// Default window for idempotency keys (24 hours)
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(86_400);

/// Default period between sweeps of expired keys
pub const DEFAULT_IDEMPOTENCY_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Errors from idempotency backends
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// Backend error (database, network, etc.)
    #[error("idempotency backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Records idempotency keys with a TTL
#[async_trait]
pub trait IdempotencyGuard: Send + Sync + 'static {
    /// Atomically record `key`; true when it was not seen within its window
    async fn check_and_record(&self, key: &str, ttl: Duration) -> Result<bool, IdempotencyError>;

    /// Drop a recorded key so the same submission can be retried
    async fn forget(&self, key: &str) -> Result<(), IdempotencyError>;

    /// Delete keys whose window has passed, returning how many were removed
    async fn purge_expired(&self) -> Result<u64, IdempotencyError>;
}
