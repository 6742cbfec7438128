// Workflow HTTP routes
//
// Thin handlers over `WorkflowEngine`: every call carries the actor taken
// from request headers, and engine errors map onto `{code, message}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use conveyor_core::{
    AuditRecord, InstanceFilter, Page, PageRequest, ReviewTask, RunRequest, TaskDecision,
    WorkflowEngine, WorkflowInstance, WorkflowStatus, WorkflowStepExecution,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::common::{Actor, ApiError, ErrorResponse, ListResponse};

/// Request to run a workflow definition
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunWorkflowRequest {
    /// Input exposed to steps as `input`.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub input: serde_json::Value,
    /// Caller-supplied context exposed to steps as `trigger`.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub trigger_context: Option<serde_json::Value>,
    /// Content entity the run is about.
    #[serde(default)]
    pub content_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunWorkflowResponse {
    pub instance_id: Uuid,
}

/// Decision on a review task
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CompleteTaskRequest {
    pub decision: TaskDecision,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListInstancesQuery {
    /// Filter by run status (e.g. RUNNING).
    pub status: Option<String>,
    pub definition_id: Option<Uuid>,
    /// 1-based page number.
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// App state for workflow routes
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
}

impl AppState {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine }
    }
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows/:definition_id/run", post(run_workflow))
        .route("/workflows/content/:content_id/start", post(start_for_content))
        .route("/workflows/instances", get(list_instances))
        .route("/workflows/instances/:instance_id", get(get_instance))
        .route(
            "/workflows/instances/:instance_id/transitions/:name",
            post(apply_transition),
        )
        .route("/workflows/instances/:instance_id/cancel", post(cancel_instance))
        .route("/workflows/instances/:instance_id/steps", get(list_steps))
        .route("/workflows/instances/:instance_id/tasks", get(list_tasks))
        .route("/workflows/instances/:instance_id/audit", get(list_audit))
        .route("/workflows/tasks/:task_id/complete", post(complete_task))
        .with_state(state)
}

/// POST /workflows/{definition_id}/run - Run a workflow definition
#[utoipa::path(
    post,
    path = "/workflows/{definition_id}/run",
    params(("definition_id" = Uuid, Path, description = "Workflow definition ID")),
    request_body = RunWorkflowRequest,
    responses(
        (status = 201, description = "Run created", body = RunWorkflowResponse),
        (status = 400, description = "Definition inactive or invalid", body = ErrorResponse),
        (status = 404, description = "Definition not found", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn run_workflow(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(definition_id): Path<Uuid>,
    Json(req): Json<RunWorkflowRequest>,
) -> Result<(StatusCode, Json<RunWorkflowResponse>), ApiError> {
    let request = RunRequest {
        content_id: req.content_id,
        input: req.input,
        trigger_context: req.trigger_context,
    };
    let instance = state.engine.run_definition(&actor, definition_id, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(RunWorkflowResponse {
            instance_id: instance.id,
        }),
    ))
}

/// POST /workflows/content/{content_id}/start - Start the active workflow for a content entity
#[utoipa::path(
    post,
    path = "/workflows/content/{content_id}/start",
    params(("content_id" = i64, Path, description = "Content entity ID")),
    responses(
        (status = 201, description = "Run created", body = WorkflowInstance),
        (status = 204, description = "No active workflow for the content type"),
        (status = 404, description = "Content not found", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn start_for_content(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(content_id): Path<i64>,
) -> Result<Response, ApiError> {
    match state.engine.start_run(&actor, content_id).await? {
        Some(instance) => Ok((StatusCode::CREATED, Json(instance)).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// GET /workflows/instances - List workflow instances
#[utoipa::path(
    get,
    path = "/workflows/instances",
    params(ListInstancesQuery),
    responses(
        (status = 200, description = "Page of instances", body = Page<WorkflowInstance>),
        (status = 400, description = "Invalid status filter", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn list_instances(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Query(query): Query<ListInstancesQuery>,
) -> Result<Json<Page<WorkflowInstance>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<WorkflowStatus>)
        .transpose()?;
    let filter = InstanceFilter {
        status,
        definition_id: query.definition_id,
    };
    let defaults = PageRequest::default();
    let page = PageRequest::new(
        query.page.unwrap_or(defaults.page),
        query.per_page.unwrap_or(defaults.per_page),
    );
    Ok(Json(state.engine.list_instances(&actor, &filter, page).await?))
}

/// GET /workflows/instances/{instance_id} - Get a workflow instance
#[utoipa::path(
    get,
    path = "/workflows/instances/{instance_id}",
    params(("instance_id" = Uuid, Path, description = "Workflow instance ID")),
    responses(
        (status = 200, description = "Instance found", body = WorkflowInstance),
        (status = 404, description = "Instance not found", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn get_instance(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    Ok(Json(state.engine.get_instance(&actor, instance_id).await?))
}

/// POST /workflows/instances/{instance_id}/transitions/{name} - Apply a transition
#[utoipa::path(
    post,
    path = "/workflows/instances/{instance_id}/transitions/{name}",
    params(
        ("instance_id" = Uuid, Path, description = "Workflow instance ID"),
        ("name" = String, Path, description = "Transition name"),
    ),
    responses(
        (status = 200, description = "Transition applied", body = WorkflowInstance),
        (status = 400, description = "Unknown transition", body = ErrorResponse),
        (status = 403, description = "Role or policy denied", body = ErrorResponse),
        (status = 409, description = "Invalid from the current state, locked or finalized", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn apply_transition(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path((instance_id, name)): Path<(Uuid, String)>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    Ok(Json(state.engine.transition(&actor, instance_id, &name).await?))
}

/// POST /workflows/instances/{instance_id}/cancel - Cancel a run
#[utoipa::path(
    post,
    path = "/workflows/instances/{instance_id}/cancel",
    params(("instance_id" = Uuid, Path, description = "Workflow instance ID")),
    responses(
        (status = 200, description = "Run cancelled", body = WorkflowInstance),
        (status = 409, description = "Locked or already finalized", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn cancel_instance(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    Ok(Json(state.engine.cancel_instance(&actor, instance_id).await?))
}

/// POST /workflows/tasks/{task_id}/complete - Record a review decision
#[utoipa::path(
    post,
    path = "/workflows/tasks/{task_id}/complete",
    params(("task_id" = Uuid, Path, description = "Review task ID")),
    request_body = CompleteTaskRequest,
    responses(
        (status = 200, description = "Decision recorded", body = WorkflowInstance),
        (status = 404, description = "Task not found", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn complete_task(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(task_id): Path<Uuid>,
    Json(req): Json<CompleteTaskRequest>,
) -> Result<Json<WorkflowInstance>, ApiError> {
    Ok(Json(
        state.engine.complete_task(&actor, task_id, req.decision).await?,
    ))
}

/// GET /workflows/instances/{instance_id}/steps - List step executions
#[utoipa::path(
    get,
    path = "/workflows/instances/{instance_id}/steps",
    params(("instance_id" = Uuid, Path, description = "Workflow instance ID")),
    responses(
        (status = 200, description = "Step executions", body = ListResponse<WorkflowStepExecution>),
        (status = 404, description = "Instance not found", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn list_steps(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<ListResponse<WorkflowStepExecution>>, ApiError> {
    let executions = state.engine.list_step_executions(&actor, instance_id).await?;
    Ok(Json(executions.into()))
}

/// GET /workflows/instances/{instance_id}/tasks - List review tasks
#[utoipa::path(
    get,
    path = "/workflows/instances/{instance_id}/tasks",
    params(("instance_id" = Uuid, Path, description = "Workflow instance ID")),
    responses(
        (status = 200, description = "Review tasks", body = ListResponse<ReviewTask>),
        (status = 404, description = "Instance not found", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<ListResponse<ReviewTask>>, ApiError> {
    let tasks = state.engine.list_tasks(&actor, instance_id).await?;
    Ok(Json(tasks.into()))
}

/// GET /workflows/instances/{instance_id}/audit - List audit records
#[utoipa::path(
    get,
    path = "/workflows/instances/{instance_id}/audit",
    params(("instance_id" = Uuid, Path, description = "Workflow instance ID")),
    responses(
        (status = 200, description = "Audit trail", body = ListResponse<AuditRecord>),
        (status = 404, description = "Instance not found", body = ErrorResponse),
    ),
    tag = "workflows"
)]
pub async fn list_audit(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<ListResponse<AuditRecord>>, ApiError> {
    let records = state.engine.list_audit(&actor, instance_id).await?;
    Ok(Json(records.into()))
}
