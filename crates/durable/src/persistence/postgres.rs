//! PostgreSQL implementation of JobStore
//!
//! Production-ready persistence using PostgreSQL with:
//! - Atomic job claiming with SKIP LOCKED
//! - Visibility timeouts via `lock_expires_at`
//! - Dead-lettering and requeue inside a single transaction

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::job::{Job, JobState};
use crate::reliability::Backoff;

const JOB_COLUMNS: &str = "id, queue_name, job_name, payload, attempts_made, max_attempts, \
     backoff, idempotency_key, state, created_at, available_at, last_error, \
     remove_on_complete, remove_on_fail";

const DEAD_LETTER_COLUMNS: &str = "id, original_queue, original_job_id, job_name, payload, \
     attempts_made, error, stack, error_history, failed_at, max_attempts, backoff, \
     remove_on_complete, remove_on_fail";

/// PostgreSQL implementation of JobStore
///
/// # Example
///
/// ```ignore
/// use conveyor_durable::PostgresJobStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/conveyor").await?;
/// PostgresJobStore::migrate(&pool).await?;
/// let store = PostgresJobStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<(), StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let backoff = serde_json::to_value(&job.backoff)?;

        sqlx::query(
            r#"
            INSERT INTO conveyor_jobs (
                id, queue_name, job_name, payload, attempts_made, max_attempts,
                backoff, idempotency_key, state, created_at, available_at,
                remove_on_complete, remove_on_fail
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.job_name)
        .bind(&job.payload)
        .bind(job.attempts_made as i32)
        .bind(job.max_attempts as i32)
        .bind(&backoff)
        .bind(&job.idempotency_key)
        .bind(job.state.to_string())
        .bind(job.created_at)
        .bind(job.available_at)
        .bind(job.remove_on_complete.map(|n| n as i32))
        .bind(job.remove_on_fail.map(|n| n as i32))
        .execute(executor)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue_name))]
    async fn add_job(&self, job: Job) -> Result<Job, StoreError> {
        Self::insert_job(&self.pool, &job).await.map_err(|e| {
            error!("Failed to add job: {}", e);
            e
        })?;

        debug!(job_name = %job.job_name, "added job");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conveyor_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn claim_jobs(
        &self,
        queue_name: &str,
        worker_id: &str,
        max_jobs: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        if max_jobs == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM conveyor_jobs
                WHERE queue_name = $1
                  AND state IN ('waiting', 'delayed')
                  AND available_at <= NOW()
                  AND NOT EXISTS (
                      SELECT 1 FROM conveyor_queue_state q
                      WHERE q.queue_name = $1 AND q.paused
                  )
                ORDER BY available_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE conveyor_jobs j
            SET state = 'active',
                locked_by = $3,
                lock_expires_at = NOW() + ($4 * INTERVAL '1 millisecond')
            FROM claimable c
            WHERE j.id = c.id
            RETURNING {}
            "#,
            prefixed_job_columns("j")
        ))
        .bind(queue_name)
        .bind(max_jobs as i64)
        .bind(worker_id)
        .bind(lock_duration.as_millis() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim jobs: {}", e);
            StoreError::from(e)
        })?;

        let mut claimed = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|j| (j.available_at, j.id));

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed jobs");
        }

        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn extend_job_lock(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE conveyor_jobs
            SET lock_expires_at = NOW() + ($3 * INTERVAL '1 millisecond')
            WHERE id = $1 AND locked_by = $2 AND state = 'active'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lock_duration.as_millis() as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, result))]
    async fn complete_job(
        &self,
        job_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE conveyor_jobs
            SET state = 'completed',
                locked_by = NULL,
                lock_expires_at = NULL,
                completed_at = NOW(),
                result = $2
            WHERE id = $1 AND state = 'active'
            RETURNING queue_name, remove_on_complete
            "#,
        )
        .bind(job_id)
        .bind(&result)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM conveyor_jobs WHERE id = $1")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match state {
                Some(state) => StoreError::NotActive { id: job_id, state },
                None => StoreError::JobNotFound(job_id),
            });
        };

        let queue_name: String = row.get("queue_name");
        let keep: Option<i32> = row.get("remove_on_complete");
        if let Some(keep) = keep {
            sqlx::query(
                r#"
                DELETE FROM conveyor_jobs
                WHERE queue_name = $1
                  AND state = 'completed'
                  AND id NOT IN (
                      SELECT id FROM conveyor_jobs
                      WHERE queue_name = $1 AND state = 'completed'
                      ORDER BY completed_at DESC, id DESC
                      LIMIT $2
                  )
                "#,
            )
            .bind(&queue_name)
            .bind(keep as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(%job_id, "completed job");
        Ok(())
    }

    #[instrument(skip(self, stack))]
    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        stack: Option<&str>,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {}, error_history FROM conveyor_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let job = job_from_row(&row)?;
        if job.state != JobState::Active {
            return Err(StoreError::NotActive {
                id: job_id,
                state: job.state.to_string(),
            });
        }

        let mut error_history: Vec<String> =
            serde_json::from_value(row.get("error_history")).unwrap_or_default();
        error_history.push(error.to_string());
        let history_json = serde_json::to_value(&error_history)?;
        let attempts_made = job.attempts_made + 1;

        if attempts_made < job.max_attempts {
            let delay = job.backoff.delay_for(attempts_made);
            let available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            let state = if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            };

            sqlx::query(
                r#"
                UPDATE conveyor_jobs
                SET state = $2,
                    attempts_made = $3,
                    available_at = $4,
                    locked_by = NULL,
                    lock_expires_at = NULL,
                    last_error = $5,
                    error_history = $6
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(state.to_string())
            .bind(attempts_made as i32)
            .bind(available_at)
            .bind(error)
            .bind(&history_json)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            debug!(%job_id, attempts_made, ?delay, "job will retry");
            return Ok(FailureOutcome::Retrying {
                attempts_made,
                delay,
            });
        }

        let entry_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO conveyor_dead_letters (
                id, original_queue, original_job_id, job_name, payload,
                attempts_made, error, stack, error_history,
                max_attempts, backoff, remove_on_complete, remove_on_fail
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry_id)
        .bind(&job.queue_name)
        .bind(job_id)
        .bind(&job.job_name)
        .bind(&job.payload)
        .bind(attempts_made as i32)
        .bind(error)
        .bind(stack)
        .bind(&history_json)
        .bind(job.max_attempts as i32)
        .bind(serde_json::to_value(&job.backoff)?)
        .bind(job.remove_on_complete.map(|n| n as i32))
        .bind(job.remove_on_fail.map(|n| n as i32))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM conveyor_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        if let Some(keep) = job.remove_on_fail {
            sqlx::query(
                r#"
                DELETE FROM conveyor_dead_letters
                WHERE original_queue = $1
                  AND id NOT IN (
                      SELECT id FROM conveyor_dead_letters
                      WHERE original_queue = $1
                      ORDER BY failed_at DESC, id DESC
                      LIMIT $2
                  )
                "#,
            )
            .bind(&job.queue_name)
            .bind(keep as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(%job_id, %entry_id, "job moved to dead letters");
        Ok(FailureOutcome::DeadLettered {
            entry_id,
            attempts_made,
        })
    }

    #[instrument(skip(self))]
    async fn reclaim_stalled(&self, queue_name: &str) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE conveyor_jobs
            SET state = 'waiting',
                available_at = NOW(),
                locked_by = NULL,
                lock_expires_at = NULL
            WHERE queue_name = $1
              AND state = 'active'
              AND lock_expires_at <= NOW()
            RETURNING id
            "#,
        )
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;

        if !ids.is_empty() {
            debug!(queue_name, count = ids.len(), "reclaimed stalled jobs");
        }
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE state = 'waiting' OR (state = 'delayed' AND available_at <= NOW())
                ) AS waiting,
                COUNT(*) FILTER (WHERE state = 'active') AS active,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'delayed' AND available_at > NOW()) AS delayed,
                (SELECT COUNT(*) FROM conveyor_dead_letters WHERE original_queue = $1) AS failed,
                (SELECT COUNT(*) FROM conveyor_workers WHERE queue_name = $1) AS workers,
                COALESCE(
                    (SELECT paused FROM conveyor_queue_state WHERE queue_name = $1),
                    FALSE
                ) AS paused
            FROM conveyor_jobs
            WHERE queue_name = $1
            "#,
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            waiting: row.get::<i64, _>("waiting") as u64,
            active: row.get::<i64, _>("active") as u64,
            completed: row.get::<i64, _>("completed") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            delayed: row.get::<i64, _>("delayed") as u64,
            workers: row.get::<i64, _>("workers") as u64,
            paused: row.get("paused"),
        })
    }

    #[instrument(skip(self))]
    async fn pause_queue(&self, queue_name: &str) -> Result<(), StoreError> {
        set_paused(&self.pool, queue_name, true).await
    }

    #[instrument(skip(self))]
    async fn resume_queue(&self, queue_name: &str) -> Result<(), StoreError> {
        set_paused(&self.pool, queue_name, false).await
    }

    async fn is_paused(&self, queue_name: &str) -> Result<bool, StoreError> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM conveyor_queue_state WHERE queue_name = $1")
                .bind(queue_name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(paused.unwrap_or(false))
    }

    #[instrument(skip(self, filter))]
    async fn list_dead_letters(
        &self,
        queue_name: &str,
        filter: &DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM conveyor_dead_letters
            WHERE original_queue = $1
              AND ($2::timestamptz IS NULL OR failed_at >= $2)
              AND ($3::timestamptz IS NULL OR failed_at <= $3)
              AND ($4::text IS NULL OR error ILIKE '%' || $4 || '%')
              AND ($5::text IS NULL
                   OR original_job_id::text LIKE '%' || $5 || '%'
                   OR id::text LIKE '%' || $5 || '%')
            ORDER BY failed_at DESC, id DESC
            OFFSET $6
            LIMIT $7
            "#,
            DEAD_LETTER_COLUMNS
        ))
        .bind(queue_name)
        .bind(filter.from)
        .bind(filter.to)
        .bind(&filter.error_contains)
        .bind(&filter.job_id_contains)
        .bind(pagination.offset as i64)
        .bind(pagination.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list dead letters: {}", e);
            StoreError::from(e)
        })?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM conveyor_dead_letters WHERE id = $1",
            DEAD_LETTER_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn requeue_dead_letter(&self, entry_id: Uuid) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM conveyor_dead_letters WHERE id = $1 FOR UPDATE",
            DEAD_LETTER_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::DeadLetterNotFound(entry_id))?;
        let entry = dead_letter_from_row(&row)?;

        let options = entry.replay_options();
        let job = Job::new(entry.original_queue, entry.job_name, entry.payload, &options);
        Self::insert_job(&mut *tx, &job).await?;

        sqlx::query("DELETE FROM conveyor_dead_letters WHERE id = $1")
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(%entry_id, job_id = %job.id, "requeued dead letter");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn delete_dead_letter(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conveyor_dead_letters WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn purge_dead_letters(&self, queue_name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM conveyor_dead_letters WHERE original_queue = $1")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn register_worker(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO conveyor_workers (
                id, queue_name, concurrency, current_load, started_at, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                queue_name = EXCLUDED.queue_name,
                concurrency = EXCLUDED.concurrency,
                current_load = EXCLUDED.current_load,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.queue_name)
        .bind(worker.concurrency as i32)
        .bind(worker.current_load as i32)
        .bind(worker.started_at)
        .bind(worker.last_heartbeat_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register worker: {}", e);
            StoreError::from(e)
        })?;

        debug!("registered worker");
        Ok(())
    }

    async fn worker_heartbeat(&self, worker_id: &str, current_load: u32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE conveyor_workers
            SET last_heartbeat_at = NOW(), current_load = $2
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(current_load as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM conveyor_workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        debug!(worker_id, "deregistered worker");
        Ok(())
    }
}

// Helper functions

async fn set_paused(pool: &PgPool, queue_name: &str, paused: bool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO conveyor_queue_state (queue_name, paused, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (queue_name) DO UPDATE SET paused = $2, updated_at = NOW()
        "#,
    )
    .bind(queue_name)
    .bind(paused)
    .execute(pool)
    .await?;

    debug!(queue_name, paused, "updated queue state");
    Ok(())
}

fn prefixed_job_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let state: String = row.get("state");
    let backoff: Backoff = serde_json::from_value(row.get("backoff"))?;

    Ok(Job {
        id: row.get("id"),
        queue_name: row.get("queue_name"),
        job_name: row.get("job_name"),
        payload: row.get("payload"),
        attempts_made: row.get::<i32, _>("attempts_made") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        backoff,
        idempotency_key: row.get("idempotency_key"),
        state: state.parse().map_err(StoreError::Database)?,
        created_at: row.get("created_at"),
        available_at: row.get("available_at"),
        last_error: row.get("last_error"),
        remove_on_complete: row
            .get::<Option<i32>, _>("remove_on_complete")
            .map(|n| n as u32),
        remove_on_fail: row.get::<Option<i32>, _>("remove_on_fail").map(|n| n as u32),
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    let error_history: Vec<String> =
        serde_json::from_value(row.get("error_history")).unwrap_or_default();
    let backoff: Backoff = serde_json::from_value(row.get("backoff"))?;

    Ok(DeadLetterEntry {
        id: row.get("id"),
        original_queue: row.get("original_queue"),
        original_job_id: row.get("original_job_id"),
        job_name: row.get("job_name"),
        payload: row.get("payload"),
        attempts_made: row.get::<i32, _>("attempts_made") as u32,
        error: row.get("error"),
        stack: row.get("stack"),
        error_history,
        failed_at: row.get("failed_at"),
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        backoff,
        remove_on_complete: row
            .get::<Option<i32>, _>("remove_on_complete")
            .map(|n| n as u32),
        remove_on_fail: row.get::<Option<i32>, _>("remove_on_fail").map(|n| n as u32),
    })
}
