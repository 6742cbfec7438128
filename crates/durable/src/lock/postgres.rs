//! PostgreSQL lock manager
//!
//! Set-if-not-exists is an upsert that only overwrites an expired row;
//! release and extend compare the lease token.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::manager::{validate_key, LockError, LockLease, LockManager};

/// PostgreSQL-backed lock manager using the `conveyor_locks` table
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
}

impl PostgresLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PostgresLockManager {
    #[instrument(skip(self))]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        validate_key(key)?;
        let lease = LockLease::new(key, ttl);

        let acquired = sqlx::query(
            r#"
            INSERT INTO conveyor_locks (key, token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE conveyor_locks.expires_at <= NOW()
            "#,
        )
        .bind(&lease.key)
        .bind(lease.token)
        .bind(lease.expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if acquired {
            debug!(key, "acquired lock");
            Ok(Some(lease))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self, lease), fields(key = %lease.key))]
    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM conveyor_locks WHERE key = $1 AND token = $2")
            .bind(&lease.key)
            .bind(lease.token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError> {
        let result = sqlx::query(
            r#"
            UPDATE conveyor_locks
            SET expires_at = NOW() + ($3 * INTERVAL '1 millisecond')
            WHERE key = $1 AND token = $2 AND expires_at > NOW()
            "#,
        )
        .bind(&lease.key)
        .bind(lease.token)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let locked: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM conveyor_locks WHERE key = $1 AND expires_at > NOW())",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(locked)
    }
}
