// Admin API tests
//
// Drive the full router with in-memory backends and the demo seed file.
// Queue workers are not started, so run jobs stay waiting in their queue.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use conveyor_control_plane::config::{definition_id, load_workflows_config};
use conveyor_control_plane::{build_router, Backends, RouterConfig, ServiceSettings, Services};
use conveyor_core::{
    ActionError, ActionExecutor, ActionOutcome, InMemoryWorkflowStore, WorkflowInstance,
    WorkflowStatus,
};
use conveyor_durable::{
    default_queues, FailureOutcome, InMemoryJobStore, Job, JobOptions, JobStore,
    WORKFLOW_RUN_QUEUE,
};
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use tower::ServiceExt;
use uuid::Uuid;

const TENANT: &str = "demo";
const ALICE_ARTICLE: i64 = 1;
const BOB_ARTICLE: i64 = 2;
const NEWSLETTER: i64 = 3;
const PODCAST: i64 = 4;

struct NoopActions;

#[async_trait]
impl ActionExecutor for NoopActions {
    async fn http_request(&self, _: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::ok(json!({})))
    }
    async fn webhook(&self, _: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::ok(json!({})))
    }
    async fn notify_user(&self, _: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::ok(json!({})))
    }
    async fn publish_content(&self, _: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::ok(json!({})))
    }
    async fn ai_generate(&self, _: &Map<String, Value>) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::ok(json!({})))
    }
}

struct TestApp {
    router: Router,
    jobs: Arc<InMemoryJobStore>,
}

fn test_app() -> TestApp {
    let seed_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/workflows.toml");
    let seed = load_workflows_config(&seed_path).unwrap();

    let workflows = Arc::new(InMemoryWorkflowStore::new());
    for definition in seed.definitions {
        workflows.insert_definition(definition);
    }
    for content in seed.content {
        workflows.upsert_content(content);
    }

    let jobs = Arc::new(InMemoryJobStore::new());
    let mut backends = Backends::in_memory();
    backends.jobs = jobs.clone();

    let services = Services::assemble(
        backends,
        workflows,
        Arc::new(NoopActions),
        seed.risk,
        &default_queues(),
        &ServiceSettings::default(),
    );
    let router = build_router(
        services.workflows_state(),
        services.queues_state(),
        &RouterConfig::default(),
    );
    TestApp { router, jobs }
}

impl TestApp {
    async fn call(&self, method: Method, uri: &str, roles: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-tenant-id", TENANT)
            .header("x-actor-id", "tester");
        if !roles.is_empty() {
            builder = builder.header("x-actor-roles", roles);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(Method::GET, uri, "", None).await
    }

    async fn post(&self, uri: &str, roles: &str) -> (StatusCode, Value) {
        self.call(Method::POST, uri, roles, None).await
    }

    async fn start_content(&self, content_id: i64) -> WorkflowInstance {
        let (status, body) = self
            .post(&format!("/workflows/content/{}/start", content_id), "")
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        serde_json::from_value(body).unwrap()
    }

    /// Dead-letter one job on `queue`, returning the entry id
    async fn dead_letter(&self, queue: &str, error: &str) -> Uuid {
        let options = JobOptions::new().with_attempts(1);
        self.jobs
            .add_job(Job::new(queue, "deliver", json!({ "to": "a@b.c" }), &options))
            .await
            .unwrap();
        let job = self
            .jobs
            .claim_jobs(queue, "w", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        match self.jobs.fail_job(job.id, error, None).await.unwrap() {
            FailureOutcome::DeadLettered { entry_id, .. } => entry_id,
            other => panic!("expected dead letter, got {:?}", other),
        }
    }
}

fn editorial_id() -> Uuid {
    definition_id(TENANT, "editorial", 1)
}

fn newsletter_id() -> Uuid {
    definition_id(TENANT, "newsletter", 1)
}

// ============================================================================
// Surface
// ============================================================================

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_openapi_document() {
    let app = test_app();
    let (status, body) = app.get("/api-doc/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/workflows/{definition_id}/run"].is_object());
    assert!(body["paths"]["/queues/{name}/dlq"].is_object());
}

#[tokio::test]
async fn test_missing_tenant_is_rejected() {
    let app = test_app();
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/workflows/instances")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

// ============================================================================
// Workflows
// ============================================================================

#[tokio::test]
async fn test_run_definition_enqueues_run_job() {
    let app = test_app();

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/workflows/{}/run", newsletter_id()),
            "",
            Some(json!({ "input": { "contentId": 3 }, "triggerContext": { "source": "test" } })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let instance_id = body["instanceId"].as_str().unwrap().to_string();

    let (status, instance) = app.get(&format!("/workflows/instances/{}", instance_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(instance["status"], "RUNNING");
    assert_eq!(instance["trigger_context"]["source"], "test");

    let (status, stats) = app
        .get(&format!("/queues/{}/stats", WORKFLOW_RUN_QUEUE))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["waiting"], 1);
    assert_eq!(stats["paused"], false);
}

#[tokio::test]
async fn test_run_unknown_definition_is_not_found() {
    let app = test_app();
    let (status, body) = app
        .call(
            Method::POST,
            &format!("/workflows/{}/run", Uuid::now_v7()),
            "",
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_start_without_active_definition_is_no_content() {
    let app = test_app();
    let (status, body) = app
        .post(&format!("/workflows/content/{}/start", PODCAST), "")
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_transition_and_invalid_transition() {
    let app = test_app();
    let instance = app.start_content(ALICE_ARTICLE).await;
    assert_eq!(instance.definition_id, editorial_id());
    assert_eq!(instance.state, "DRAFT");

    let uri = format!("/workflows/instances/{}/transitions/start", instance.id);
    let (status, body) = app.post(&uri, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "IN_REVIEW");

    // start is only valid from DRAFT
    let (status, body) = app.post(&uri, "").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");

    let (status, body) = app
        .post(
            &format!("/workflows/instances/{}/transitions/teleport", instance.id),
            "",
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UNKNOWN_TRANSITION");
}

#[tokio::test]
async fn test_recent_author_is_routed_to_legal_review() {
    let app = test_app();
    let instance = app.start_content(BOB_ARTICLE).await;

    let (status, body) = app
        .post(
            &format!("/workflows/instances/{}/transitions/start", instance.id),
            "",
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "LEGAL_REVIEW");
}

#[tokio::test]
async fn test_role_gated_transition() {
    let app = test_app();
    let instance = app.start_content(ALICE_ARTICLE).await;
    app.post(
        &format!("/workflows/instances/{}/transitions/start", instance.id),
        "",
    )
    .await;

    let uri = format!("/workflows/instances/{}/transitions/approve", instance.id);
    let (status, body) = app.post(&uri, "writer,system").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, body) = app.post(&uri, "editor").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "PUBLISHED");
    assert_eq!(body["status"], "COMPLETED");

    let (_, audit) = app
        .get(&format!("/workflows/instances/{}/audit", instance.id))
        .await;
    let outcomes: Vec<&str> = audit["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["outcome"].as_str().unwrap())
        .collect();
    assert!(outcomes.contains(&"denied"));
}

#[tokio::test]
async fn test_review_tasks_complete_the_run() {
    let app = test_app();
    let instance = app.start_content(ALICE_ARTICLE).await;
    app.post(
        &format!("/workflows/instances/{}/transitions/start", instance.id),
        "",
    )
    .await;

    let (status, tasks) = app
        .get(&format!("/workflows/instances/{}/tasks", instance.id))
        .await;
    assert_eq!(status, StatusCode::OK);
    let task_ids: Vec<String> = tasks["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(task_ids.len(), 2);

    let mut last = Value::Null;
    for task_id in &task_ids {
        let (status, body) = app
            .call(
                Method::POST,
                &format!("/workflows/tasks/{}/complete", task_id),
                "",
                Some(json!({ "decision": "APPROVED" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        last = body;
    }
    assert_eq!(last["state"], "PUBLISHED");
    assert_eq!(last["status"], "COMPLETED");

    // Re-completing a decided task returns the current instance
    let (status, body) = app
        .call(
            Method::POST,
            &format!("/workflows/tasks/{}/complete", task_ids[0]),
            "",
            Some(json!({ "decision": "REJECTED" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "PUBLISHED");
}

#[tokio::test]
async fn test_cancel_is_terminal() {
    let app = test_app();
    let instance = app.start_content(NEWSLETTER).await;
    let uri = format!("/workflows/instances/{}/cancel", instance.id);

    let (status, body) = app.post(&uri, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELLED");

    let (status, body) = app.post(&uri, "").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INSTANCE_FINALIZED");
}

#[tokio::test]
async fn test_list_instances_paginates_and_filters() {
    let app = test_app();
    for _ in 0..3 {
        app.start_content(NEWSLETTER).await;
    }
    let cancelled = app.start_content(ALICE_ARTICLE).await;
    app.post(&format!("/workflows/instances/{}/cancel", cancelled.id), "")
        .await;

    let (status, page) = app.get("/workflows/instances?page=1&per_page=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 4);
    assert_eq!(page["per_page"], 2);
    assert_eq!(page["data"].as_array().unwrap().len(), 2);

    let (_, page) = app.get("/workflows/instances?page=2&per_page=3").await;
    assert_eq!(page["data"].as_array().unwrap().len(), 1);

    let (_, page) = app.get("/workflows/instances?status=CANCELLED").await;
    assert_eq!(page["total"], 1);

    let (_, page) = app
        .get(&format!("/workflows/instances?definition_id={}", newsletter_id()))
        .await;
    assert_eq!(page["total"], 3);

    let (status, body) = app.get("/workflows/instances?status=SLEEPING").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_instances_are_tenant_scoped() {
    let app = test_app();
    let instance = app.start_content(NEWSLETTER).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/workflows/instances/{}", instance.id))
                .header("x-tenant-id", "other")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(instance.status, WorkflowStatus::Running);
}

// ============================================================================
// Queues
// ============================================================================

#[tokio::test]
async fn test_pause_and_resume() {
    let app = test_app();

    let (status, body) = app.post("/queues/email:send/pause", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], true);

    let (status, body) = app.post("/queues/email:send/resume", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["paused"], false);
}

#[tokio::test]
async fn test_dead_letter_inspect_and_replay() {
    let app = test_app();
    let entry_id = app.dead_letter("email:send", "smtp refused").await;

    let (status, list) = app.get("/queues/email:send/dlq").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["data"].as_array().unwrap().len(), 1);
    assert_eq!(list["data"][0]["error"], "smtp refused");

    let (_, list) = app.get("/queues/email:send/dlq?error=timeout").await;
    assert!(list["data"].as_array().unwrap().is_empty());

    let (status, entry) = app.get(&format!("/queues/email:send/dlq/{}", entry_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["originalQueue"], "email:send");
    assert_eq!(entry["attemptsMade"], 1);
    assert_eq!(entry["maxAttempts"], 1);

    // Entries are scoped to their origin queue
    let (status, _) = app.get(&format!("/queues/ai:content/dlq/{}", entry_id)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .post(&format!("/queues/email:send/dlq/{}/replay", entry_id), "")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"], "email:send");

    let (_, stats) = app.get("/queues/email:send/stats").await;
    assert_eq!(stats["waiting"], 1);
    let (_, list) = app.get("/queues/email:send/dlq").await;
    assert!(list["data"].as_array().unwrap().is_empty());

    let (status, body) = app
        .post(&format!("/queues/email:send/dlq/{}/replay", entry_id), "")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_batch_replay_reports_failures() {
    let app = test_app();
    let first = app.dead_letter("email:send", "boom").await;
    let foreign = app.dead_letter("ai:content", "boom").await;
    let missing = Uuid::now_v7();

    let (status, body) = app
        .call(
            Method::POST,
            "/queues/email:send/dlq/replay",
            "",
            Some(json!({ "ids": [first, foreign, missing] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!([first]));
    let failed: Vec<&str> = body["failed"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["id"].as_str().unwrap())
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.contains(&foreign.to_string().as_str()));
    assert!(failed.contains(&missing.to_string().as_str()));
}

#[tokio::test]
async fn test_delete_and_purge() {
    let app = test_app();
    let doomed = app.dead_letter("email:send", "boom").await;
    app.dead_letter("email:send", "boom").await;
    app.dead_letter("email:send", "boom").await;

    let (status, _) = app
        .call(
            Method::DELETE,
            &format!("/queues/email:send/dlq/{}", doomed),
            "",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = app
        .call(Method::DELETE, "/queues/email:send/dlq", "", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["purged"], 2);

    let (_, stats) = app.get("/queues/email:send/stats").await;
    assert_eq!(stats["waiting"], 0);
}
