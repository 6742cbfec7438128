// In-memory workflow store for examples and testing
//
// Transactions buffer their writes and apply them under one write lock on
// commit, so readers never observe a partially applied unit of work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::WorkflowStoreError;
use crate::model::{
    AuditRecord, ContentRef, ReviewTask, StepStatus, WorkflowDefinition, WorkflowInstance,
    WorkflowStepExecution,
};
use crate::store::{InstanceFilter, Page, PageRequest, StoreResult, WorkflowStore, WorkflowTx};

#[derive(Default)]
struct State {
    content: HashMap<(String, i64), ContentRef>,
    definitions: HashMap<Uuid, WorkflowDefinition>,
    instances: HashMap<Uuid, WorkflowInstance>,
    executions: Vec<WorkflowStepExecution>,
    tasks: HashMap<Uuid, ReviewTask>,
    audit: Vec<AuditRecord>,
}

// ============================================================================
// InMemoryWorkflowStore
// ============================================================================

/// In-memory workflow store
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    state: Arc<RwLock<State>>,
    commit_failures: Arc<AtomicU32>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition (seeding helper)
    pub fn insert_definition(&self, definition: WorkflowDefinition) {
        self.state
            .write()
            .definitions
            .insert(definition.id, definition);
    }

    /// Insert or replace a content entity (seeding helper)
    pub fn upsert_content(&self, content: ContentRef) {
        self.state
            .write()
            .content
            .insert((content.tenant_id.clone(), content.id), content);
    }

    /// Make the next `n` commits fail with a backend error
    pub fn inject_commit_failures(&self, n: u32) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    pub fn instance_count(&self) -> usize {
        self.state.read().instances.len()
    }

    pub fn definition_count(&self) -> usize {
        self.state.read().definitions.len()
    }

    fn take_commit_failure(&self) -> bool {
        self.commit_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn find_content(&self, tenant_id: &str, content_id: i64) -> StoreResult<Option<ContentRef>> {
        Ok(self
            .state
            .read()
            .content
            .get(&(tenant_id.to_string(), content_id))
            .cloned())
    }

    async fn find_active_definition(
        &self,
        tenant_id: &str,
        workspace_id: Option<&str>,
        content_type: &str,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        let state = self.state.read();
        let mut candidates: Vec<&WorkflowDefinition> = state
            .definitions
            .values()
            .filter(|d| {
                d.tenant_id == tenant_id
                    && d.active
                    && d.content_type == content_type
                    && d.applies_to_workspace(workspace_id)
            })
            .collect();

        // Workspace-specific first, then newest version
        candidates.sort_by(|a, b| {
            (b.workspace_id.is_some(), b.version, b.created_at)
                .cmp(&(a.workspace_id.is_some(), a.version, a.created_at))
        });
        Ok(candidates.first().map(|d| (*d).clone()))
    }

    async fn get_definition(
        &self,
        tenant_id: &str,
        definition_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self
            .state
            .read()
            .definitions
            .get(&definition_id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
    ) -> StoreResult<Option<WorkflowInstance>> {
        Ok(self
            .state
            .read()
            .instances
            .get(&instance_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_instances(
        &self,
        tenant_id: &str,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> StoreResult<Page<WorkflowInstance>> {
        let state = self.state.read();
        let mut matching: Vec<&WorkflowInstance> = state
            .instances
            .values()
            .filter(|i| i.tenant_id == tenant_id && filter.matches(i))
            .collect();
        matching.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));

        Ok(Page {
            total: matching.len() as u64,
            data: matching
                .into_iter()
                .skip(page.offset())
                .take(page.per_page as usize)
                .cloned()
                .collect(),
            page: page.page,
            per_page: page.per_page,
        })
    }

    async fn get_task(&self, tenant_id: &str, task_id: Uuid) -> StoreResult<Option<ReviewTask>> {
        Ok(self
            .state
            .read()
            .tasks
            .get(&task_id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_tasks(&self, tenant_id: &str, instance_id: Uuid) -> StoreResult<Vec<ReviewTask>> {
        let mut tasks: Vec<ReviewTask> = self
            .state
            .read()
            .tasks
            .values()
            .filter(|t| t.tenant_id == tenant_id && t.instance_id == instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn list_step_executions(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
    ) -> StoreResult<Vec<WorkflowStepExecution>> {
        let state = self.state.read();
        let owned = state
            .instances
            .get(&instance_id)
            .is_some_and(|i| i.tenant_id == tenant_id);
        if !owned {
            return Ok(vec![]);
        }
        Ok(state
            .executions
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_audit(&self, tenant_id: &str, instance_id: Uuid) -> StoreResult<Vec<AuditRecord>> {
        Ok(self
            .state
            .read()
            .audit
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn begin(&self, tenant_id: &str) -> StoreResult<Box<dyn WorkflowTx>> {
        Ok(Box::new(InMemoryTx {
            store: self.clone(),
            tenant_id: tenant_id.to_string(),
            ops: Vec::new(),
        }))
    }
}

// ============================================================================
// InMemoryTx
// ============================================================================

enum TxOp {
    InsertInstance(WorkflowInstance),
    UpdateInstance(WorkflowInstance),
    InsertExecution(WorkflowStepExecution),
    UpdateExecution(WorkflowStepExecution),
    InsertTask(ReviewTask),
    UpdateTask(ReviewTask),
    AppendAudit(AuditRecord),
}

struct InMemoryTx {
    store: InMemoryWorkflowStore,
    tenant_id: String,
    ops: Vec<TxOp>,
}

impl InMemoryTx {
    /// Check every buffered write against the committed state plus the
    /// writes staged before it
    fn validate(&self, state: &State) -> StoreResult<()> {
        let mut instances: HashMap<Uuid, &WorkflowInstance> = HashMap::new();
        let mut executions: HashMap<Uuid, StepStatus> = HashMap::new();

        let instance_tenant_ok = |instances: &HashMap<Uuid, &WorkflowInstance>, id: Uuid| {
            instances
                .get(&id)
                .copied()
                .or_else(|| state.instances.get(&id))
                .is_some_and(|i| i.tenant_id == self.tenant_id)
        };

        for op in &self.ops {
            match op {
                TxOp::InsertInstance(instance) => {
                    if instance.tenant_id != self.tenant_id {
                        return Err(WorkflowStoreError::not_found("instance", instance.id));
                    }
                    instances.insert(instance.id, instance);
                }
                TxOp::UpdateInstance(instance) => {
                    let current = instances
                        .get(&instance.id)
                        .copied()
                        .or_else(|| state.instances.get(&instance.id))
                        .filter(|i| i.tenant_id == self.tenant_id)
                        .ok_or_else(|| WorkflowStoreError::not_found("instance", instance.id))?;
                    if current.status.is_terminal() {
                        return Err(WorkflowStoreError::InstanceFinalized(instance.id));
                    }
                    instances.insert(instance.id, instance);
                }
                TxOp::InsertExecution(execution) => {
                    if !instance_tenant_ok(&instances, execution.instance_id) {
                        return Err(WorkflowStoreError::not_found("instance", execution.instance_id));
                    }
                    executions.insert(execution.id, execution.status);
                }
                TxOp::UpdateExecution(execution) => {
                    let current = executions.get(&execution.id).copied().or_else(|| {
                        state
                            .executions
                            .iter()
                            .find(|e| e.id == execution.id)
                            .map(|e| e.status)
                    });
                    match current {
                        None => {
                            return Err(WorkflowStoreError::not_found(
                                "step execution",
                                execution.id,
                            ))
                        }
                        Some(status) if status.is_terminal() => {
                            return Err(WorkflowStoreError::ExecutionImmutable(execution.id))
                        }
                        Some(_) => {
                            executions.insert(execution.id, execution.status);
                        }
                    }
                }
                TxOp::InsertTask(task) | TxOp::UpdateTask(task) => {
                    if task.tenant_id != self.tenant_id
                        || !instance_tenant_ok(&instances, task.instance_id)
                    {
                        return Err(WorkflowStoreError::not_found("task", task.id));
                    }
                }
                TxOp::AppendAudit(record) => {
                    if record.tenant_id != self.tenant_id {
                        return Err(WorkflowStoreError::Backend(
                            "audit record tenant mismatch".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowTx for InMemoryTx {
    fn insert_instance(&mut self, instance: WorkflowInstance) {
        self.ops.push(TxOp::InsertInstance(instance));
    }

    fn update_instance(&mut self, instance: WorkflowInstance) {
        self.ops.push(TxOp::UpdateInstance(instance));
    }

    fn insert_step_execution(&mut self, execution: WorkflowStepExecution) {
        self.ops.push(TxOp::InsertExecution(execution));
    }

    fn update_step_execution(&mut self, execution: WorkflowStepExecution) {
        self.ops.push(TxOp::UpdateExecution(execution));
    }

    fn insert_task(&mut self, task: ReviewTask) {
        self.ops.push(TxOp::InsertTask(task));
    }

    fn update_task(&mut self, task: ReviewTask) {
        self.ops.push(TxOp::UpdateTask(task));
    }

    fn append_audit(&mut self, record: AuditRecord) {
        self.ops.push(TxOp::AppendAudit(record));
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.store.take_commit_failure() {
            return Err(WorkflowStoreError::Backend("injected commit failure".to_string()));
        }

        let store = self.store.clone();
        let mut state = store.state.write();
        self.validate(&state)?;

        for op in self.ops {
            match op {
                TxOp::InsertInstance(instance) | TxOp::UpdateInstance(instance) => {
                    state.instances.insert(instance.id, instance);
                }
                TxOp::InsertExecution(execution) => state.executions.push(execution),
                TxOp::UpdateExecution(execution) => {
                    if let Some(slot) = state.executions.iter_mut().find(|e| e.id == execution.id) {
                        *slot = execution;
                    }
                }
                TxOp::InsertTask(task) | TxOp::UpdateTask(task) => {
                    state.tasks.insert(task.id, task);
                }
                TxOp::AppendAudit(record) => state.audit.push(record),
            }
        }
        Ok(())
    }
}
