// Workflow persistence traits
//
// Every read takes an explicit tenant id; writes go through a unit of work
// obtained from `begin`, so any storage engine can provide the transaction
// boundary. Queue side effects happen after `commit` returns.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::WorkflowStoreError;
use crate::model::{
    AuditRecord, ContentRef, ReviewTask, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
    WorkflowStepExecution,
};

pub type StoreResult<T> = std::result::Result<T, WorkflowStoreError>;

/// Filter for listing instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<WorkflowStatus>,
    pub definition_id: Option<Uuid>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.status.map_or(true, |s| instance.status == s)
            && self.definition_id.map_or(true, |d| instance.definition_id == d)
    }
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl PageRequest {
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.per_page as usize
    }
}

/// One page of results with the unpaginated total
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

// ============================================================================
// WorkflowStore - tenant-scoped reads and transaction entry point
// ============================================================================

/// Trait for workflow persistence
///
/// Implementations can:
/// - Store records in a relational database
/// - Keep records in memory for testing
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    async fn find_content(&self, tenant_id: &str, content_id: i64)
        -> StoreResult<Option<ContentRef>>;

    /// Active definition for a content type; a workspace-specific definition
    /// wins over a tenant-wide one
    async fn find_active_definition(
        &self,
        tenant_id: &str,
        workspace_id: Option<&str>,
        content_type: &str,
    ) -> StoreResult<Option<WorkflowDefinition>>;

    async fn get_definition(
        &self,
        tenant_id: &str,
        definition_id: Uuid,
    ) -> StoreResult<Option<WorkflowDefinition>>;

    async fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
    ) -> StoreResult<Option<WorkflowInstance>>;

    async fn list_instances(
        &self,
        tenant_id: &str,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> StoreResult<Page<WorkflowInstance>>;

    async fn get_task(&self, tenant_id: &str, task_id: Uuid) -> StoreResult<Option<ReviewTask>>;

    async fn list_tasks(&self, tenant_id: &str, instance_id: Uuid) -> StoreResult<Vec<ReviewTask>>;

    /// Step executions of an instance in the order they were started
    async fn list_step_executions(
        &self,
        tenant_id: &str,
        instance_id: Uuid,
    ) -> StoreResult<Vec<WorkflowStepExecution>>;

    async fn list_audit(&self, tenant_id: &str, instance_id: Uuid) -> StoreResult<Vec<AuditRecord>>;

    /// Open a unit of work scoped to a tenant
    async fn begin(&self, tenant_id: &str) -> StoreResult<Box<dyn WorkflowTx>>;
}

// ============================================================================
// WorkflowTx - unit of work
// ============================================================================

/// Buffered writes applied atomically by `commit`
///
/// Dropping a transaction without committing discards its writes.
/// `commit` fails with `InstanceFinalized` when an updated instance is
/// already terminal in the store, and with `ExecutionImmutable` when an
/// updated step execution already reached a terminal status.
#[async_trait]
pub trait WorkflowTx: Send {
    fn insert_instance(&mut self, instance: WorkflowInstance);

    fn update_instance(&mut self, instance: WorkflowInstance);

    fn insert_step_execution(&mut self, execution: WorkflowStepExecution);

    fn update_step_execution(&mut self, execution: WorkflowStepExecution);

    fn insert_task(&mut self, task: ReviewTask);

    fn update_task(&mut self, task: ReviewTask);

    fn append_audit(&mut self, record: AuditRecord);

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
