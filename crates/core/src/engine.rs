// Workflow engine
//
// Applies transitions, task decisions and cancellations to instances. Every
// mutation runs under the instance lock, consults the policy gate, writes an
// audit record in the same unit of work, and publishes a best-effort event
// after commit. Run jobs are enqueued only after the creating transaction
// has committed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use conveyor_durable::{
    instance_lock_key, publish_best_effort, workflow_channel, Backoff, EventEnvelope,
    EventPublisher, HeldLock, Job, JobOptions, JobProducer, LockManager, QueueError,
    WORKFLOW_RUN_QUEUE,
};

use crate::error::{EngineError, Result};
use crate::model::{
    ActorContext, AuditOutcome, AuditRecord, ReviewTask, RunJobPayload, TaskDecision, TaskStatus,
    WorkflowDefinition, WorkflowInstance, WorkflowStatus, WorkflowStepExecution,
    APPROVE_TRANSITION, REJECT_TRANSITION, START_TRANSITION,
};
use crate::policy::{actions, PolicyDecision, PolicyGate};
use crate::state_machine::{authorize, is_final, resolve_transition, route_start, NoRisk, RiskPredicate};
use crate::store::{InstanceFilter, Page, PageRequest, WorkflowStore, WorkflowTx};

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queue carrying run-workflow jobs
    pub run_queue: String,
    /// TTL of the per-instance lock (extended by heartbeat while held)
    pub lock_ttl: Duration,
    pub run_attempts: u32,
    pub run_backoff: Backoff,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_queue: WORKFLOW_RUN_QUEUE.to_string(),
            lock_ttl: Duration::from_secs(60),
            run_attempts: 5,
            run_backoff: Backoff::exponential(Duration::from_secs(2)),
        }
    }
}

impl EngineConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_run_attempts(mut self, attempts: u32) -> Self {
        self.run_attempts = attempts.max(1);
        self
    }

    pub fn with_run_backoff(mut self, backoff: Backoff) -> Self {
        self.run_backoff = backoff;
        self
    }
}

/// Request to run a specific definition
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub content_id: Option<i64>,
    pub input: Value,
    pub trigger_context: Option<Value>,
}

/// Workflow engine
///
/// Cheap to clone; all dependencies are shared handles.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    producer: JobProducer,
    locks: Arc<dyn LockManager>,
    policy: Arc<dyn PolicyGate>,
    risk: Arc<dyn RiskPredicate>,
    events: Arc<dyn EventPublisher>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        producer: JobProducer,
        locks: Arc<dyn LockManager>,
        policy: Arc<dyn PolicyGate>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            producer,
            locks,
            policy,
            risk: Arc::new(NoRisk),
            events,
            config: EngineConfig::default(),
        }
    }

    pub fn with_risk_predicate(mut self, risk: Arc<dyn RiskPredicate>) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Starting runs
    // ========================================================================

    /// Start a run for a content entity
    ///
    /// `Ok(None)` when no active definition matches the content type.
    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id))]
    pub async fn start_run(
        &self,
        actor: &ActorContext,
        content_id: i64,
    ) -> Result<Option<WorkflowInstance>> {
        self.check_policy(actor, actions::START, &format!("content:{}", content_id))
            .await?;

        let content = self
            .store
            .find_content(&actor.tenant_id, content_id)
            .await?
            .ok_or_else(|| EngineError::not_found("content", content_id))?;

        let Some(definition) = self
            .store
            .find_active_definition(
                &actor.tenant_id,
                actor.workspace_id.as_deref(),
                &content.content_type,
            )
            .await?
        else {
            debug!(content_type = %content.content_type, "no active workflow definition");
            return Ok(None);
        };

        let request = RunRequest {
            content_id: Some(content_id),
            input: json!({ "contentId": content_id, "contentType": content.content_type }),
            trigger_context: None,
        };
        self.create_instance(actor, &definition, request).await.map(Some)
    }

    /// Start a run of a specific definition
    #[instrument(skip(self, actor, request), fields(tenant_id = %actor.tenant_id))]
    pub async fn run_definition(
        &self,
        actor: &ActorContext,
        definition_id: Uuid,
        request: RunRequest,
    ) -> Result<WorkflowInstance> {
        self.check_policy(
            actor,
            actions::START,
            &format!("workflow_definition:{}", definition_id),
        )
        .await?;

        let definition = self
            .store
            .get_definition(&actor.tenant_id, definition_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow definition", definition_id))?;
        if !definition.active {
            return Err(EngineError::InvalidDefinition(format!(
                "definition {} is not active",
                definition_id
            )));
        }

        self.create_instance(actor, &definition, request).await
    }

    async fn create_instance(
        &self,
        actor: &ActorContext,
        definition: &WorkflowDefinition,
        request: RunRequest,
    ) -> Result<WorkflowInstance> {
        definition.validate()?;

        let mut instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: definition.id,
            content_id: request.content_id,
            tenant_id: actor.tenant_id.clone(),
            workspace_id: actor
                .workspace_id
                .clone()
                .or_else(|| definition.workspace_id.clone()),
            state: definition.graph.initial_state.clone(),
            status: WorkflowStatus::Pending,
            started_by: actor.actor_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            input: request.input,
            output: None,
            error_message: None,
            trigger_context: request.trigger_context,
        };

        // Held until the instance is marked running, so a worker never
        // observes the PENDING -> RUNNING write racing its own
        let lock = self.lock_instance(instance.id).await?;

        let mut tx = self.store.begin(&instance.tenant_id).await?;
        tx.insert_instance(instance.clone());
        for task in open_review_tasks(definition, &instance) {
            tx.insert_task(task);
        }
        tx.append_audit(
            AuditRecord::new(&instance, actor, "start_run", AuditOutcome::Applied)
                .with_states("", instance.state.clone()),
        );
        if let Err(e) = tx.commit().await {
            release(lock).await;
            return Err(e.into());
        }

        info!(instance_id = %instance.id, definition_id = %definition.id, "workflow run created");
        self.publish(&instance, "workflow.started", json!({
            "instanceId": instance.id,
            "definitionId": definition.id,
            "state": instance.state,
        }))
        .await;

        match enqueue_run_job(&self.producer, &self.config, &instance, 0).await {
            Ok(_) => {
                instance.status = WorkflowStatus::Running;
                let mut tx = self.store.begin(&instance.tenant_id).await?;
                tx.update_instance(instance.clone());
                if let Err(e) = tx.commit().await {
                    error!(instance_id = %instance.id, "failed to mark run as running: {}", e);
                    instance.status = WorkflowStatus::Pending;
                }
            }
            Err(e) => {
                error!(instance_id = %instance.id, "failed to dispatch run job, instance left pending: {}", e);
            }
        }

        release(lock).await;
        Ok(instance)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Apply a named transition
    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id))]
    pub async fn transition(
        &self,
        actor: &ActorContext,
        instance_id: Uuid,
        name: &str,
    ) -> Result<WorkflowInstance> {
        let lock = self.lock_instance(instance_id).await?;
        let result = self.transition_locked(actor, instance_id, name).await;
        release(lock).await;
        result
    }

    async fn transition_locked(
        &self,
        actor: &ActorContext,
        instance_id: Uuid,
        name: &str,
    ) -> Result<WorkflowInstance> {
        let mut instance = self.load_instance(&actor.tenant_id, instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InstanceFinalized(instance.id));
        }
        let definition = self.load_definition(&instance).await?;

        let resource = format!("workflow_instance:{}", instance.id);
        if let PolicyDecision::Deny(reason) =
            self.policy.check(actor, actions::TRANSITION, &resource).await
        {
            self.audit_denial(&instance, actor, name, &reason).await;
            return Err(EngineError::Forbidden(reason));
        }

        let transition = resolve_transition(&definition, &instance.state, name)?;
        if !authorize(transition, actor) {
            let reason = format!("transition '{}' requires one of the roles {:?}", name, transition.required_roles);
            self.audit_denial(&instance, actor, name, &reason).await;
            return Err(EngineError::Forbidden(reason));
        }

        let target = if name == START_TRANSITION {
            let content = match instance.content_id {
                Some(id) => self.store.find_content(&instance.tenant_id, id).await?,
                None => None,
            };
            route_start(self.risk.as_ref(), &definition, content.as_ref(), &transition.to)
        } else {
            transition.to.clone()
        };

        let mut tx = self.store.begin(&instance.tenant_id).await?;
        let from = instance.state.clone();
        apply_state_change(tx.as_mut(), &definition, &mut instance, actor, name, &target);
        tx.commit().await?;

        self.publish_transition(&instance, name, &from).await;
        Ok(instance)
    }

    /// Record a decision on a review task
    ///
    /// Re-completing a decided task returns the current instance unchanged.
    /// Once every task of the run is decided, `reject` (any rejection) or
    /// `approve` is applied automatically when it is valid from the current
    /// state.
    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id))]
    pub async fn complete_task(
        &self,
        actor: &ActorContext,
        task_id: Uuid,
        decision: TaskDecision,
    ) -> Result<WorkflowInstance> {
        let task = self
            .store
            .get_task(&actor.tenant_id, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;

        let lock = self.lock_instance(task.instance_id).await?;
        let result = self.complete_task_locked(actor, task_id, decision).await;
        release(lock).await;
        result
    }

    async fn complete_task_locked(
        &self,
        actor: &ActorContext,
        task_id: Uuid,
        decision: TaskDecision,
    ) -> Result<WorkflowInstance> {
        let mut task = self
            .store
            .get_task(&actor.tenant_id, task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        let mut instance = self.load_instance(&actor.tenant_id, task.instance_id).await?;

        if task.is_decided() {
            debug!(%task_id, "task already decided, returning current instance");
            return Ok(instance);
        }
        if instance.status.is_terminal() {
            return Err(EngineError::InstanceFinalized(instance.id));
        }

        let resource = format!("review_task:{}", task.id);
        if let PolicyDecision::Deny(reason) =
            self.policy.check(actor, actions::COMPLETE_TASK, &resource).await
        {
            self.audit_denial(&instance, actor, "complete_task", &reason).await;
            return Err(EngineError::Forbidden(reason));
        }

        let definition = self.load_definition(&instance).await?;
        let mut tx = self.store.begin(&instance.tenant_id).await?;

        task.status = TaskStatus::Completed;
        task.decision = Some(decision);
        task.decided_by = Some(actor.actor_id.clone());
        task.decided_at = Some(Utc::now());
        tx.update_task(task.clone());
        tx.append_audit(
            AuditRecord::new(&instance, actor, "complete_task", AuditOutcome::Applied)
                .with_detail(format!("{:?} {:?}", task.task_type, decision)),
        );

        let tasks: Vec<ReviewTask> = self
            .store
            .list_tasks(&instance.tenant_id, instance.id)
            .await?
            .into_iter()
            .map(|t| if t.id == task.id { task.clone() } else { t })
            .collect();

        let mut auto_applied = None;
        if tasks.iter().all(ReviewTask::is_decided) {
            let name = if tasks
                .iter()
                .any(|t| t.decision == Some(TaskDecision::Rejected))
            {
                REJECT_TRANSITION
            } else {
                APPROVE_TRANSITION
            };

            match resolve_transition(&definition, &instance.state, name) {
                Ok(transition) => {
                    let target = transition.to.clone();
                    let from = instance.state.clone();
                    let system = ActorContext::system(instance.tenant_id.clone());
                    apply_state_change(tx.as_mut(), &definition, &mut instance, &system, name, &target);
                    auto_applied = Some((name, from));
                }
                Err(e) => debug!(transition = name, "automatic transition skipped: {}", e),
            }
        }

        tx.commit().await?;

        self.publish(&instance, "workflow.task_completed", json!({
            "instanceId": instance.id,
            "taskId": task.id,
            "taskType": task.task_type,
            "decision": decision,
        }))
        .await;
        if let Some((name, from)) = auto_applied {
            self.publish_transition(&instance, name, &from).await;
        }
        Ok(instance)
    }

    /// Cancel a pending or running instance
    #[instrument(skip(self, actor), fields(tenant_id = %actor.tenant_id))]
    pub async fn cancel_instance(
        &self,
        actor: &ActorContext,
        instance_id: Uuid,
    ) -> Result<WorkflowInstance> {
        let lock = self.lock_instance(instance_id).await?;
        let result = self.cancel_locked(actor, instance_id).await;
        release(lock).await;
        result
    }

    async fn cancel_locked(&self, actor: &ActorContext, instance_id: Uuid) -> Result<WorkflowInstance> {
        let mut instance = self.load_instance(&actor.tenant_id, instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InstanceFinalized(instance.id));
        }

        let resource = format!("workflow_instance:{}", instance.id);
        if let PolicyDecision::Deny(reason) =
            self.policy.check(actor, actions::CANCEL, &resource).await
        {
            self.audit_denial(&instance, actor, "cancel", &reason).await;
            return Err(EngineError::Forbidden(reason));
        }

        instance.status = WorkflowStatus::Cancelled;
        instance.finished_at = Some(Utc::now());

        let mut tx = self.store.begin(&instance.tenant_id).await?;
        tx.update_instance(instance.clone());
        tx.append_audit(AuditRecord::new(&instance, actor, "cancel", AuditOutcome::Applied));
        tx.commit().await?;

        info!(instance_id = %instance.id, "workflow run cancelled");
        self.publish(&instance, "workflow.cancelled", json!({ "instanceId": instance.id }))
            .await;
        Ok(instance)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_instance(&self, actor: &ActorContext, instance_id: Uuid) -> Result<WorkflowInstance> {
        self.load_instance(&actor.tenant_id, instance_id).await
    }

    pub async fn list_instances(
        &self,
        actor: &ActorContext,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> Result<Page<WorkflowInstance>> {
        Ok(self
            .store
            .list_instances(&actor.tenant_id, filter, page)
            .await?)
    }

    pub async fn list_tasks(&self, actor: &ActorContext, instance_id: Uuid) -> Result<Vec<ReviewTask>> {
        self.load_instance(&actor.tenant_id, instance_id).await?;
        Ok(self.store.list_tasks(&actor.tenant_id, instance_id).await?)
    }

    pub async fn list_step_executions(
        &self,
        actor: &ActorContext,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowStepExecution>> {
        self.load_instance(&actor.tenant_id, instance_id).await?;
        Ok(self
            .store
            .list_step_executions(&actor.tenant_id, instance_id)
            .await?)
    }

    pub async fn list_audit(&self, actor: &ActorContext, instance_id: Uuid) -> Result<Vec<AuditRecord>> {
        self.load_instance(&actor.tenant_id, instance_id).await?;
        Ok(self.store.list_audit(&actor.tenant_id, instance_id).await?)
    }

    // ========================================================================
    // Shared helpers (also used by the run-workflow handler)
    // ========================================================================

    /// Acquire the instance lock; `Conflict` on contention
    pub(crate) async fn lock_instance(&self, instance_id: Uuid) -> Result<HeldLock> {
        HeldLock::acquire(
            Arc::clone(&self.locks),
            &instance_lock_key(instance_id),
            self.config.lock_ttl,
        )
        .await?
        .ok_or_else(|| {
            EngineError::Conflict(format!("workflow instance {} is locked", instance_id))
        })
    }

    pub(crate) async fn load_instance(&self, tenant_id: &str, instance_id: Uuid) -> Result<WorkflowInstance> {
        self.store
            .get_instance(tenant_id, instance_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow instance", instance_id))
    }

    pub(crate) async fn load_definition(&self, instance: &WorkflowInstance) -> Result<WorkflowDefinition> {
        self.store
            .get_definition(&instance.tenant_id, instance.definition_id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow definition", instance.definition_id))
    }

    pub(crate) fn producer(&self) -> &JobProducer {
        &self.producer
    }

    pub(crate) async fn publish(&self, instance: &WorkflowInstance, event_type: &str, data: Value) {
        let event = EventEnvelope::new(workflow_channel(&instance.tenant_id), event_type, data)
            .with_tenant(instance.tenant_id.clone());
        publish_best_effort(self.events.as_ref(), event).await;
    }

    async fn publish_transition(&self, instance: &WorkflowInstance, name: &str, from: &str) {
        self.publish(instance, "workflow.transitioned", json!({
            "instanceId": instance.id,
            "transition": name,
            "from": from,
            "to": instance.state,
        }))
        .await;
        if instance.status == WorkflowStatus::Completed {
            self.publish(instance, "workflow.completed", json!({ "instanceId": instance.id }))
                .await;
        }
    }

    async fn check_policy(&self, actor: &ActorContext, action: &str, resource: &str) -> Result<()> {
        match self.policy.check(actor, action, resource).await {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => {
                warn!(actor = %actor.actor_id, action, resource, "policy denied: {}", reason);
                Err(EngineError::Forbidden(reason))
            }
        }
    }

    /// Denials are audited in their own unit of work
    async fn audit_denial(&self, instance: &WorkflowInstance, actor: &ActorContext, action: &str, reason: &str) {
        warn!(instance_id = %instance.id, actor = %actor.actor_id, action, "denied: {}", reason);
        let record = AuditRecord::new(instance, actor, action, AuditOutcome::Denied).with_detail(reason);
        let result = async {
            let mut tx = self.store.begin(&instance.tenant_id).await?;
            tx.append_audit(record);
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            error!(instance_id = %instance.id, "failed to audit denial: {}", e);
        }
    }
}

/// Move an instance to `target`, opening its review tasks and completing
/// the run when `target` is final
fn apply_state_change(
    tx: &mut dyn WorkflowTx,
    definition: &WorkflowDefinition,
    instance: &mut WorkflowInstance,
    actor: &ActorContext,
    transition: &str,
    target: &str,
) {
    let from = std::mem::replace(&mut instance.state, target.to_string());
    if is_final(definition, target) {
        instance.status = WorkflowStatus::Completed;
        instance.finished_at = Some(Utc::now());
    }

    for task in open_review_tasks(definition, instance) {
        tx.insert_task(task);
    }
    tx.update_instance(instance.clone());
    tx.append_audit(
        AuditRecord::new(instance, actor, transition, AuditOutcome::Applied).with_states(from, target),
    );
}

fn open_review_tasks(definition: &WorkflowDefinition, instance: &WorkflowInstance) -> Vec<ReviewTask> {
    definition
        .graph
        .review_tasks_for(&instance.state)
        .iter()
        .map(|task_type| ReviewTask::open(instance, *task_type))
        .collect()
}

/// Enqueue the run job for `step_index`; deduplicated per instance and step
pub(crate) async fn enqueue_run_job(
    producer: &JobProducer,
    config: &EngineConfig,
    instance: &WorkflowInstance,
    step_index: usize,
) -> std::result::Result<Option<Job>, QueueError> {
    let payload = RunJobPayload {
        workflow_instance_id: instance.id,
        tenant_id: instance.tenant_id.clone(),
        step_index: Some(step_index),
    };
    let options = JobOptions::new()
        .with_idempotency_key(payload.idempotency_key())
        .with_attempts(config.run_attempts)
        .with_backoff(config.run_backoff.clone());
    let payload = serde_json::to_value(&payload)
        .map_err(|e| QueueError::InvalidJob(e.to_string()))?;

    producer
        .enqueue(&config.run_queue, "run-workflow", payload, options)
        .await
}

pub(crate) async fn release(lock: HeldLock) {
    let key = lock.lease().key.clone();
    if let Err(e) = lock.release().await {
        warn!(%key, "failed to release instance lock: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryWorkflowStore;
    use crate::model::{ContentRef, Transition, WorkflowGraph};
    use crate::policy::AllowAll;
    use async_trait::async_trait;
    use conveyor_durable::{
        InMemoryIdempotencyGuard, InMemoryJobStore, InMemoryLockManager, NoopEventPublisher,
    };
    use std::collections::{BTreeMap, BTreeSet};

    struct DenyCancel;

    #[async_trait]
    impl PolicyGate for DenyCancel {
        async fn check(&self, _actor: &ActorContext, action: &str, _resource: &str) -> PolicyDecision {
            if action == actions::CANCEL {
                PolicyDecision::Deny("cancellation disabled".to_string())
            } else {
                PolicyDecision::Allow
            }
        }
    }

    struct Fixture {
        engine: WorkflowEngine,
        store: InMemoryWorkflowStore,
        jobs: Arc<InMemoryJobStore>,
        locks: Arc<InMemoryLockManager>,
    }

    fn fixture(policy: Arc<dyn PolicyGate>) -> Fixture {
        let store = InMemoryWorkflowStore::new();
        let jobs = Arc::new(InMemoryJobStore::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let producer = JobProducer::new(jobs.clone(), Arc::new(InMemoryIdempotencyGuard::new()));
        let engine = WorkflowEngine::new(
            Arc::new(store.clone()),
            producer,
            locks.clone(),
            policy,
            Arc::new(NoopEventPublisher),
        );

        store.insert_definition(WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: "t1".to_string(),
            workspace_id: None,
            name: "editorial".to_string(),
            version: 1,
            content_type: "ARTICLE".to_string(),
            active: true,
            graph: WorkflowGraph {
                states: ["DRAFT", "IN_REVIEW", "PUBLISHED"].into_iter().map(String::from).collect(),
                transitions: BTreeMap::from([
                    ("start".to_string(), Transition::new("DRAFT", "IN_REVIEW")),
                    (
                        "approve".to_string(),
                        Transition::new("IN_REVIEW", "PUBLISHED").with_roles(["editor"]),
                    ),
                ]),
                initial_state: "DRAFT".to_string(),
                final_states: BTreeSet::from(["PUBLISHED".to_string()]),
                review_tasks: BTreeMap::new(),
            },
            steps: vec![],
            created_at: Utc::now(),
        });
        store.upsert_content(ContentRef {
            id: 42,
            tenant_id: "t1".to_string(),
            content_type: "ARTICLE".to_string(),
            author_id: None,
            author_tenure_days: None,
            metadata: json!({}),
        });

        Fixture { engine, store, jobs, locks }
    }

    fn author() -> ActorContext {
        ActorContext::new("u1", "t1")
    }

    #[tokio::test]
    async fn test_start_run_enqueues_and_marks_running() {
        let f = fixture(Arc::new(AllowAll));
        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();

        assert_eq!(instance.state, "DRAFT");
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert_eq!(f.jobs.jobs_in(WORKFLOW_RUN_QUEUE).len(), 1);
        assert!(!f.locks.is_locked(&instance_lock_key(instance.id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_run_without_definition_is_none() {
        let f = fixture(Arc::new(AllowAll));
        f.store.upsert_content(ContentRef {
            id: 7,
            tenant_id: "t1".to_string(),
            content_type: "PODCAST".to_string(),
            author_id: None,
            author_tenure_days: None,
            metadata: json!({}),
        });
        assert!(f.engine.start_run(&author(), 7).await.unwrap().is_none());
        assert_eq!(f.store.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_failure_leaves_instance_pending() {
        let f = fixture(Arc::new(AllowAll));
        f.jobs.inject_enqueue_failures(1);

        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();
        assert_eq!(instance.status, WorkflowStatus::Pending);
        let stored = f.engine.get_instance(&author(), instance.id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_instance_unchanged() {
        let f = fixture(Arc::new(AllowAll));
        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();

        let err = f
            .engine
            .transition(&author().with_roles(["editor"]), instance.id, "approve")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(f.engine.get_instance(&author(), instance.id).await.unwrap(), instance);
    }

    #[tokio::test]
    async fn test_role_mismatch_is_forbidden_and_audited() {
        let f = fixture(Arc::new(AllowAll));
        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();
        f.engine.transition(&author(), instance.id, "start").await.unwrap();

        let err = f.engine.transition(&author(), instance.id, "approve").await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");

        let audit = f.engine.list_audit(&author(), instance.id).await.unwrap();
        assert_eq!(audit.last().unwrap().outcome, AuditOutcome::Denied);

        let done = f
            .engine
            .transition(&author().with_roles(["editor"]), instance.id, "approve")
            .await
            .unwrap();
        assert_eq!(done.state, "PUBLISHED");
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_locked_instance_is_conflict() {
        let f = fixture(Arc::new(AllowAll));
        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();

        let held = f
            .locks
            .acquire(&instance_lock_key(instance.id), Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let err = f.engine.transition(&author(), instance.id, "start").await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        f.locks.release(&held).await.unwrap();
        assert!(f.engine.transition(&author(), instance.id, "start").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let f = fixture(Arc::new(AllowAll));
        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();

        let cancelled = f.engine.cancel_instance(&author(), instance.id).await.unwrap();
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

        let err = f.engine.transition(&author(), instance.id, "start").await.unwrap_err();
        assert_eq!(err.code(), "INSTANCE_FINALIZED");
        let err = f.engine.cancel_instance(&author(), instance.id).await.unwrap_err();
        assert_eq!(err.code(), "INSTANCE_FINALIZED");
    }

    #[tokio::test]
    async fn test_policy_denial_blocks_cancel() {
        let f = fixture(Arc::new(DenyCancel));
        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();

        let err = f.engine.cancel_instance(&author(), instance.id).await.unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
        let stored = f.engine.get_instance(&author(), instance.id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_other_tenant_cannot_see_instance() {
        let f = fixture(Arc::new(AllowAll));
        let instance = f.engine.start_run(&author(), 42).await.unwrap().unwrap();

        let err = f
            .engine
            .get_instance(&ActorContext::new("u2", "t2"), instance.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
