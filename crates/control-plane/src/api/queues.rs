// Queue administration HTTP routes
//
// Stats, pause/resume and dead-letter recovery for named queues. Dead-letter
// entries are addressed by entry id and scoped to the queue in the path.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use conveyor_durable::{
    DeadLetterEntry, DeadLetterManager, DlqFilter, JobStore, Pagination, QueueStats,
    ReplayBatchResult,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::{Actor, ApiError, ErrorResponse, ListResponse};

/// Counters for one queue
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueStatsResponse {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    /// Live workers consuming the queue.
    pub workers: u64,
    pub paused: bool,
}

impl From<QueueStats> for QueueStatsResponse {
    fn from(stats: QueueStats) -> Self {
        Self {
            waiting: stats.waiting,
            active: stats.active,
            completed: stats.completed,
            failed: stats.failed,
            delayed: stats.delayed,
            workers: stats.workers,
            paused: stats.paused,
        }
    }
}

/// A dead-lettered job
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    pub id: Uuid,
    pub original_queue: String,
    pub original_job_id: Uuid,
    pub job_name: String,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub attempts_made: u32,
    /// Attempt budget the job gets again on replay.
    pub max_attempts: u32,
    /// Last error message.
    pub error: String,
    pub stack: Option<String>,
    /// Error of every attempt, oldest first.
    pub error_history: Vec<String>,
    pub failed_at: DateTime<Utc>,
}

impl From<DeadLetterEntry> for DeadLetterResponse {
    fn from(entry: DeadLetterEntry) -> Self {
        Self {
            id: entry.id,
            original_queue: entry.original_queue,
            original_job_id: entry.original_job_id,
            job_name: entry.job_name,
            payload: entry.payload,
            attempts_made: entry.attempts_made,
            max_attempts: entry.max_attempts,
            error: entry.error,
            stack: entry.stack,
            error_history: entry.error_history,
            failed_at: entry.failed_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DlqQuery {
    /// Only entries that failed at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only entries that failed at or before this time.
    pub to: Option<DateTime<Utc>>,
    /// Substring of the last error message.
    pub error: Option<String>,
    /// Substring of the entry or original job id.
    pub job_id: Option<String>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

/// Batch replay request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ReplayBatchRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplayFailureResponse {
    pub id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReplayBatchResponse {
    pub success: Vec<Uuid>,
    pub failed: Vec<ReplayFailureResponse>,
}

impl From<ReplayBatchResult> for ReplayBatchResponse {
    fn from(result: ReplayBatchResult) -> Self {
        Self {
            success: result.success,
            failed: result
                .failed
                .into_iter()
                .map(|f| ReplayFailureResponse {
                    id: f.id,
                    error: f.error,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    /// Id of the newly enqueued job.
    pub job_id: Uuid,
    pub queue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PurgeResponse {
    pub purged: u64,
}

/// App state for queue routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub dlq: DeadLetterManager,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, dlq: DeadLetterManager) -> Self {
        Self { store, dlq }
    }

    /// Load an entry, hiding entries that belong to another queue
    async fn entry_in_queue(&self, queue: &str, entry_id: Uuid) -> Result<DeadLetterEntry, ApiError> {
        let entry = self.dlq.inspect(entry_id).await?;
        if entry.original_queue != queue {
            return Err(ApiError::not_found(format!(
                "dead-letter entry not found: {}",
                entry_id
            )));
        }
        Ok(entry)
    }
}

/// Create queue routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/queues/:name/stats", get(queue_stats))
        .route("/queues/:name/pause", post(pause_queue))
        .route("/queues/:name/resume", post(resume_queue))
        .route("/queues/:name/dlq", get(list_dead_letters).delete(purge_dead_letters))
        .route("/queues/:name/dlq/replay", post(replay_batch))
        .route(
            "/queues/:name/dlq/:job_id",
            get(get_dead_letter).delete(delete_dead_letter),
        )
        .route("/queues/:name/dlq/:job_id/replay", post(replay_dead_letter))
        .with_state(state)
}

/// GET /queues/{name}/stats - Queue counters
#[utoipa::path(
    get,
    path = "/queues/{name}/stats",
    params(("name" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Queue counters", body = QueueStatsResponse),
    ),
    tag = "queues"
)]
pub async fn queue_stats(
    State(state): State<AppState>,
    Actor(_actor): Actor,
    Path(name): Path<String>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = state.store.queue_stats(&name).await?;
    Ok(Json(stats.into()))
}

/// POST /queues/{name}/pause - Stop workers from claiming new jobs
#[utoipa::path(
    post,
    path = "/queues/{name}/pause",
    params(("name" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Queue paused", body = QueueStatsResponse),
    ),
    tag = "queues"
)]
pub async fn pause_queue(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(name): Path<String>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    state.store.pause_queue(&name).await?;
    tracing::info!(queue = %name, actor = %actor.actor_id, "queue paused");
    Ok(Json(state.store.queue_stats(&name).await?.into()))
}

/// POST /queues/{name}/resume - Let workers claim jobs again
#[utoipa::path(
    post,
    path = "/queues/{name}/resume",
    params(("name" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Queue resumed", body = QueueStatsResponse),
    ),
    tag = "queues"
)]
pub async fn resume_queue(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(name): Path<String>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    state.store.resume_queue(&name).await?;
    tracing::info!(queue = %name, actor = %actor.actor_id, "queue resumed");
    Ok(Json(state.store.queue_stats(&name).await?.into()))
}

/// GET /queues/{name}/dlq - List dead-lettered jobs
#[utoipa::path(
    get,
    path = "/queues/{name}/dlq",
    params(("name" = String, Path, description = "Queue name"), DlqQuery),
    responses(
        (status = 200, description = "Dead-lettered jobs, newest first", body = ListResponse<DeadLetterResponse>),
    ),
    tag = "queues"
)]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Actor(_actor): Actor,
    Path(name): Path<String>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<ListResponse<DeadLetterResponse>>, ApiError> {
    let defaults = Pagination::default();
    let page = Pagination {
        offset: query.offset.unwrap_or(defaults.offset),
        limit: query.limit.unwrap_or(defaults.limit).clamp(1, defaults.limit),
    };
    let filter = DlqFilter {
        from: query.from,
        to: query.to,
        error_contains: query.error.filter(|s| !s.is_empty()),
        job_id_contains: query.job_id.filter(|s| !s.is_empty()),
    };
    let entries = state.dlq.list(&name, &filter, page).await?;
    Ok(Json(
        entries
            .into_iter()
            .map(DeadLetterResponse::from)
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// GET /queues/{name}/dlq/{job_id} - Inspect a dead-lettered job
#[utoipa::path(
    get,
    path = "/queues/{name}/dlq/{job_id}",
    params(
        ("name" = String, Path, description = "Queue name"),
        ("job_id" = Uuid, Path, description = "Dead-letter entry ID"),
    ),
    responses(
        (status = 200, description = "Dead-lettered job", body = DeadLetterResponse),
        (status = 404, description = "Entry not found", body = ErrorResponse),
    ),
    tag = "queues"
)]
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Actor(_actor): Actor,
    Path((name, job_id)): Path<(String, Uuid)>,
) -> Result<Json<DeadLetterResponse>, ApiError> {
    let entry = state.entry_in_queue(&name, job_id).await?;
    Ok(Json(entry.into()))
}

/// POST /queues/{name}/dlq/{job_id}/replay - Re-submit a dead-lettered job
#[utoipa::path(
    post,
    path = "/queues/{name}/dlq/{job_id}/replay",
    params(
        ("name" = String, Path, description = "Queue name"),
        ("job_id" = Uuid, Path, description = "Dead-letter entry ID"),
    ),
    responses(
        (status = 200, description = "Job re-enqueued", body = ReplayResponse),
        (status = 404, description = "Entry not found", body = ErrorResponse),
    ),
    tag = "queues"
)]
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((name, job_id)): Path<(String, Uuid)>,
) -> Result<Json<ReplayResponse>, ApiError> {
    state.entry_in_queue(&name, job_id).await?;
    let job = state.dlq.replay(job_id).await?;
    tracing::info!(queue = %name, entry_id = %job_id, actor = %actor.actor_id, "dead letter replayed");
    Ok(Json(ReplayResponse {
        job_id: job.id,
        queue: job.queue_name,
    }))
}

/// POST /queues/{name}/dlq/replay - Re-submit several dead-lettered jobs
///
/// Ids that belong to another queue are reported as failures.
#[utoipa::path(
    post,
    path = "/queues/{name}/dlq/replay",
    params(("name" = String, Path, description = "Queue name")),
    request_body = ReplayBatchRequest,
    responses(
        (status = 200, description = "Per-entry outcome", body = ReplayBatchResponse),
    ),
    tag = "queues"
)]
pub async fn replay_batch(
    State(state): State<AppState>,
    Actor(_actor): Actor,
    Path(name): Path<String>,
    Json(req): Json<ReplayBatchRequest>,
) -> Result<Json<ReplayBatchResponse>, ApiError> {
    let mut in_queue = Vec::with_capacity(req.ids.len());
    let mut foreign = Vec::new();
    for id in req.ids {
        match state.entry_in_queue(&name, id).await {
            Ok(_) => in_queue.push(id),
            Err(e) if e.status == StatusCode::NOT_FOUND => foreign.push(ReplayFailureResponse {
                id,
                error: e.body.message,
            }),
            Err(e) => return Err(e),
        }
    }

    let mut response = ReplayBatchResponse::from(state.dlq.replay_batch(&in_queue).await);
    response.failed.extend(foreign);
    Ok(Json(response))
}

/// DELETE /queues/{name}/dlq/{job_id} - Drop a dead-lettered job
#[utoipa::path(
    delete,
    path = "/queues/{name}/dlq/{job_id}",
    params(
        ("name" = String, Path, description = "Queue name"),
        ("job_id" = Uuid, Path, description = "Dead-letter entry ID"),
    ),
    responses(
        (status = 204, description = "Entry deleted"),
        (status = 404, description = "Entry not found", body = ErrorResponse),
    ),
    tag = "queues"
)]
pub async fn delete_dead_letter(
    State(state): State<AppState>,
    Actor(_actor): Actor,
    Path((name, job_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.entry_in_queue(&name, job_id).await?;
    if state.dlq.delete(job_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "dead-letter entry not found: {}",
            job_id
        )))
    }
}

/// DELETE /queues/{name}/dlq - Purge every dead-lettered job of a queue
#[utoipa::path(
    delete,
    path = "/queues/{name}/dlq",
    params(("name" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Entries purged", body = PurgeResponse),
    ),
    tag = "queues"
)]
pub async fn purge_dead_letters(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(name): Path<String>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let purged = state.dlq.purge(&name).await?;
    tracing::warn!(queue = %name, purged, actor = %actor.actor_id, "dead letters purged");
    Ok(Json(PurgeResponse { purged }))
}
