//! LockManager trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Errors from lock backends
///
/// Contention is not an error: [`LockManager::acquire`] returns `None`.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Invalid lock key
    #[error("invalid lock key: {0}")]
    InvalidKey(String),

    /// Backend error (database, network, etc.)
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Proof of holding a lock
///
/// The token is unique per acquisition; release and extend only succeed
/// while the stored token still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub(crate) fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            token: Uuid::now_v7(),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }
}

/// Lock key guarding all mutations of a workflow instance
pub fn instance_lock_key(instance_id: impl std::fmt::Display) -> String {
    format!("lock:workflow:instance:{}", instance_id)
}

/// Short-lived mutual exclusion with TTL
///
/// Any key-value backend with an atomic set-if-not-exists satisfies this
/// trait. Acquisition is a single non-blocking attempt and is not
/// reentrant: a second `acquire` on a held key returns `None` even for
/// the same caller.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// Try to take the lock; `None` when another live lease holds it
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError>;

    /// Release the lock if `lease` still holds it
    ///
    /// Returns false when the lease had already expired or been replaced.
    async fn release(&self, lease: &LockLease) -> Result<bool, LockError>;

    /// Push the expiry of a held lock forward
    ///
    /// Returns false when the lease no longer holds the lock.
    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError>;

    /// Whether a live lease exists for `key`
    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;
}

pub(crate) fn validate_key(key: &str) -> Result<(), LockError> {
    if key.trim().is_empty() {
        return Err(LockError::InvalidKey("lock key must not be empty".to_string()));
    }
    Ok(())
}
