// OpenAPI specification generation
//
// This module defines the OpenAPI spec for the Conveyor admin API.
// It is served by the API server and printed by the export-openapi binary.

use crate::api;
use crate::api::ListResponse;
use conveyor_core::{
    AuditOutcome, AuditRecord, Page, ReviewTask, StepStatus, TaskDecision, TaskStatus, TaskType,
    WorkflowInstance, WorkflowStatus, WorkflowStepExecution,
};
use utoipa::OpenApi;

/// OpenAPI documentation for the Conveyor admin API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::workflows::run_workflow,
        api::workflows::start_for_content,
        api::workflows::list_instances,
        api::workflows::get_instance,
        api::workflows::apply_transition,
        api::workflows::cancel_instance,
        api::workflows::complete_task,
        api::workflows::list_steps,
        api::workflows::list_tasks,
        api::workflows::list_audit,
        api::queues::queue_stats,
        api::queues::pause_queue,
        api::queues::resume_queue,
        api::queues::list_dead_letters,
        api::queues::get_dead_letter,
        api::queues::replay_dead_letter,
        api::queues::replay_batch,
        api::queues::delete_dead_letter,
        api::queues::purge_dead_letters,
    ),
    components(
        schemas(
            WorkflowInstance, WorkflowStatus,
            WorkflowStepExecution, StepStatus,
            ReviewTask, TaskType, TaskStatus, TaskDecision,
            AuditRecord, AuditOutcome,
            Page<WorkflowInstance>,
            ListResponse<WorkflowStepExecution>,
            ListResponse<ReviewTask>,
            ListResponse<AuditRecord>,
            api::ErrorResponse,
            api::workflows::RunWorkflowRequest, api::workflows::RunWorkflowResponse,
            api::workflows::CompleteTaskRequest,
            // Queue types
            api::queues::QueueStatsResponse,
            api::queues::DeadLetterResponse,
            ListResponse<api::queues::DeadLetterResponse>,
            api::queues::ReplayResponse,
            api::queues::ReplayBatchRequest, api::queues::ReplayBatchResponse,
            api::queues::ReplayFailureResponse,
            api::queues::PurgeResponse,
        )
    ),
    tags(
        (name = "workflows", description = "Workflow runs, transitions and review tasks"),
        (name = "queues", description = "Queue statistics, pause/resume and dead-letter recovery")
    ),
    info(
        title = "Conveyor Admin API",
        version = "0.1.0",
        description = "Administrative API for workflow runs and durable job queues",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}
