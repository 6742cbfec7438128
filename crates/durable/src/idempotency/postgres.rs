use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use super::{IdempotencyError, IdempotencyGuard};

/// PostgreSQL-backed idempotency guard using `conveyor_idempotency_keys`
#[derive(Clone)]
pub struct PostgresIdempotencyGuard {
    pool: PgPool,
}

impl PostgresIdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyGuard for PostgresIdempotencyGuard {
    #[instrument(skip(self))]
    async fn check_and_record(&self, key: &str, ttl: Duration) -> Result<bool, IdempotencyError> {
        // An existing row is only overwritten once it has expired
        let result = sqlx::query(
            r#"
            INSERT INTO conveyor_idempotency_keys (key, expires_at)
            VALUES ($1, NOW() + ($2 * INTERVAL '1 millisecond'))
            ON CONFLICT (key) DO UPDATE
                SET expires_at = EXCLUDED.expires_at
                WHERE conveyor_idempotency_keys.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn forget(&self, key: &str) -> Result<(), IdempotencyError> {
        sqlx::query("DELETE FROM conveyor_idempotency_keys WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let result = sqlx::query("DELETE FROM conveyor_idempotency_keys WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
