// Run-workflow job handler
//
// Consumes `workflows:run` jobs: one job executes one step of one instance
// under the instance lock, then schedules the next step after its own
// transaction has committed. Redelivered jobs whose step already succeeded
// only re-schedule the follow-up, which the producer deduplicates.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use conveyor_durable::{HandlerRegistry, HeldLock, Job, JobError, JobResult};

use crate::actions::{resolve_input, ActionExecutor, StepExecutor};
use crate::engine::{enqueue_run_job, release, WorkflowEngine};
use crate::error::EngineError;
use crate::model::{
    RunJobPayload, StepSpec, StepStatus, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
    WorkflowStepExecution,
};
use crate::state_machine::is_final;

/// Handler for run-workflow jobs
pub struct WorkflowRunner {
    engine: WorkflowEngine,
    executor: StepExecutor,
}

impl WorkflowRunner {
    pub fn new(engine: WorkflowEngine, actions: Arc<dyn ActionExecutor>) -> Self {
        Self {
            engine,
            executor: StepExecutor::new(actions),
        }
    }

    /// Register on the engine's run queue
    pub fn register(self: Arc<Self>, registry: &mut HandlerRegistry) {
        let queue = self.engine.config().run_queue.clone();
        registry.register(queue, move |job| {
            let runner = Arc::clone(&self);
            async move { runner.handle(job).await }
        });
    }

    /// Run one step of the instance named by the job payload
    ///
    /// `Err` means retry: lock contention or an infrastructure fault.
    /// Permanent step failures complete the job and fail the instance.
    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempts_made + 1))]
    pub async fn handle(&self, job: Job) -> JobResult {
        let payload: RunJobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::new(format!("invalid run payload: {}", e)))?;

        let lock = self
            .engine
            .lock_instance(payload.workflow_instance_id)
            .await
            .map_err(job_error)?;
        let result = self.run_locked(&job, &payload, &lock).await;
        release(lock).await;
        result
    }

    async fn run_locked(&self, job: &Job, payload: &RunJobPayload, lock: &HeldLock) -> JobResult {
        let instance_id = payload.workflow_instance_id;
        let mut instance = match self
            .engine
            .load_instance(&payload.tenant_id, instance_id)
            .await
        {
            Ok(instance) => instance,
            Err(EngineError::NotFound { .. }) => {
                warn!(%instance_id, tenant_id = %payload.tenant_id, "workflow instance not found, dropping run job");
                return Ok(json!({ "skipped": "not_found" }));
            }
            Err(e) => return Err(job_error(e)),
        };

        if instance.status.is_terminal() {
            debug!(%instance_id, status = %instance.status, "instance already terminal");
            return Ok(json!({ "skipped": instance.status.as_str() }));
        }

        let definition = self.engine.load_definition(&instance).await.map_err(job_error)?;

        if instance.status == WorkflowStatus::Pending {
            instance.status = WorkflowStatus::Running;
            let mut tx = self.engine.store().begin(&instance.tenant_id).await.map_err(job_error)?;
            tx.update_instance(instance.clone());
            tx.commit().await.map_err(job_error)?;
        }

        let steps = definition.ordered_steps();
        let index = payload.step_index.unwrap_or(0);
        let Some(step) = steps.get(index).copied() else {
            return self.finish_without_steps(&definition, instance).await;
        };
        let is_last = index + 1 == steps.len();

        let executions = self
            .engine
            .store()
            .list_step_executions(&instance.tenant_id, instance_id)
            .await
            .map_err(job_error)?;
        if executions
            .iter()
            .any(|e| e.step_id == step.id && e.status == StepStatus::Success)
        {
            debug!(%instance_id, step_id = %step.id, "step already succeeded, rescheduling follow-up");
            if !is_last {
                self.schedule(&instance, index + 1).await?;
            }
            return Ok(json!({ "skipped": step.id }));
        }

        self.run_step(job, lock, &definition, instance, step, index, is_last).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        job: &Job,
        lock: &HeldLock,
        definition: &WorkflowDefinition,
        instance: WorkflowInstance,
        step: &StepSpec,
        index: usize,
        is_last: bool,
    ) -> JobResult {
        let context = step_context(&instance);
        let mut execution = WorkflowStepExecution::started(
            instance.id,
            step,
            Value::Object(resolve_input(step, &context)),
            job.attempts_made,
        );

        let mut tx = self.engine.store().begin(&instance.tenant_id).await.map_err(job_error)?;
        tx.insert_step_execution(execution.clone());
        tx.commit().await.map_err(job_error)?;

        let outcome = match self.executor.execute(step, &context).await {
            Ok(outcome) => outcome,
            Err(fault) => {
                warn!(instance_id = %instance.id, step_id = %step.id, "step fault, will retry: {}", fault);
                execution.finish(StepStatus::Failed, None, Some(fault.to_string()));
                self.record_execution(&instance, execution).await;
                self.engine
                    .publish(&instance, "workflow.step_failed", json!({
                        "instanceId": instance.id,
                        "stepId": step.id,
                        "error": fault.to_string(),
                        "retryable": true,
                    }))
                    .await;
                return Err(JobError::new(format!("step '{}' failed: {}", step.id, fault)));
            }
        };

        execution.input = outcome.input.clone();

        // A lapsed lease means another runner may own the instance now
        if !still_held(lock).await {
            warn!(instance_id = %instance.id, step_id = %step.id, "instance lock lost during step, will retry");
            execution.finish(
                StepStatus::Failed,
                outcome.output.clone(),
                Some("instance lock lost before the result was committed".to_string()),
            );
            self.record_execution(&instance, execution).await;
            return Err(JobError::new(format!(
                "instance lock lost during step '{}'",
                step.id
            )));
        }

        let status = if outcome.success { StepStatus::Success } else { StepStatus::Failed };
        execution.finish(status, outcome.output.clone(), outcome.error.clone());

        // Write on top of the committed instance, not the copy loaded before the step
        let mut current = self
            .engine
            .load_instance(&instance.tenant_id, instance.id)
            .await
            .map_err(job_error)?;
        let mut tx = self.engine.store().begin(&current.tenant_id).await.map_err(job_error)?;
        tx.update_step_execution(execution.clone());

        if current.status.is_terminal() {
            tx.commit().await.map_err(job_error)?;
            info!(instance_id = %current.id, step_id = %step.id, "instance finalized during step, execution recorded only");
            return Ok(json!({ "stepId": step.id, "status": status }));
        }

        if outcome.success {
            merge_output(&mut current, &step.id, outcome.output.clone());
            if is_last {
                complete_if_final(definition, &mut current);
            }
        } else {
            current.status = WorkflowStatus::Failed;
            current.error_message = Some(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("step '{}' failed", step.id)),
            );
            current.finished_at = Some(Utc::now());
        }
        tx.update_instance(current.clone());
        tx.commit().await.map_err(job_error)?;

        if outcome.success {
            self.engine
                .publish(&current, "workflow.step_succeeded", json!({
                    "instanceId": current.id,
                    "stepId": step.id,
                    "stepIndex": index,
                }))
                .await;
        } else {
            self.engine
                .publish(&current, "workflow.step_failed", json!({
                    "instanceId": current.id,
                    "stepId": step.id,
                    "error": current.error_message,
                    "retryable": false,
                }))
                .await;
            self.engine
                .publish(&current, "workflow.failed", json!({
                    "instanceId": current.id,
                    "error": current.error_message,
                }))
                .await;
            info!(instance_id = %current.id, step_id = %step.id, "workflow run failed");
            return Ok(json!({ "stepId": step.id, "status": status }));
        }

        if is_last {
            if current.status == WorkflowStatus::Completed {
                info!(instance_id = %current.id, "workflow run completed");
                self.engine
                    .publish(&current, "workflow.completed", json!({ "instanceId": current.id }))
                    .await;
            }
        } else {
            self.schedule(&current, index + 1).await?;
        }

        Ok(json!({ "stepId": step.id, "status": status }))
    }

    /// Past the last step: a definition with no steps, or a stray job
    async fn finish_without_steps(
        &self,
        definition: &WorkflowDefinition,
        mut instance: WorkflowInstance,
    ) -> JobResult {
        if definition.steps.is_empty() {
            complete_if_final(definition, &mut instance);
            if instance.status == WorkflowStatus::Completed {
                let mut tx = self.engine.store().begin(&instance.tenant_id).await.map_err(job_error)?;
                tx.update_instance(instance.clone());
                tx.commit().await.map_err(job_error)?;
                self.engine
                    .publish(&instance, "workflow.completed", json!({ "instanceId": instance.id }))
                    .await;
            }
        }
        Ok(json!({ "skipped": "no_step" }))
    }

    async fn schedule(&self, instance: &WorkflowInstance, step_index: usize) -> Result<(), JobError> {
        match enqueue_run_job(self.engine.producer(), self.engine.config(), instance, step_index).await {
            Ok(Some(job)) => {
                debug!(instance_id = %instance.id, step_index, job_id = %job.id, "next step scheduled");
                Ok(())
            }
            Ok(None) => {
                debug!(instance_id = %instance.id, step_index, "next step already scheduled");
                Ok(())
            }
            Err(e) => {
                error!(instance_id = %instance.id, step_index, "failed to schedule next step: {}", e);
                Err(JobError::new(format!("failed to schedule step {}: {}", step_index, e)))
            }
        }
    }

    async fn record_execution(&self, instance: &WorkflowInstance, execution: WorkflowStepExecution) {
        let result = async {
            let mut tx = self.engine.store().begin(&instance.tenant_id).await?;
            tx.update_step_execution(execution);
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            error!(instance_id = %instance.id, "failed to record step execution: {}", e);
        }
    }
}

async fn still_held(lock: &HeldLock) -> bool {
    match lock.confirm().await {
        Ok(held) => held,
        Err(e) => {
            warn!(key = %lock.lease().key, "could not confirm instance lock: {}", e);
            false
        }
    }
}

/// Values visible to input mappings
fn step_context(instance: &WorkflowInstance) -> Value {
    json!({
        "input": instance.input,
        "output": instance.output.clone().unwrap_or_else(|| json!({})),
        "contentId": instance.content_id,
        "instanceId": instance.id,
        "trigger": instance.trigger_context,
    })
}

/// Step outputs accumulate under the step id
fn merge_output(instance: &mut WorkflowInstance, step_id: &str, output: Option<Value>) {
    let mut merged = match instance.output.take() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    merged.insert(step_id.to_string(), output.unwrap_or(Value::Null));
    instance.output = Some(Value::Object(merged));
}

/// All steps done: complete unless the graph still has a final state to reach
fn complete_if_final(definition: &WorkflowDefinition, instance: &mut WorkflowInstance) {
    if definition.graph.final_states.is_empty() || is_final(definition, &instance.state) {
        instance.status = WorkflowStatus::Completed;
        instance.finished_at = Some(Utc::now());
    }
}

fn job_error(e: impl std::fmt::Display) -> JobError {
    JobError::new(e.to_string())
}
