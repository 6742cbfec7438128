// Workflow domain model
//
// Definitions are immutable once instances reference them; instances carry
// two distinct positions: `state` (node in the definition graph) and
// `status` (operational outcome of the run).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::error::EngineError;

pub type StateName = String;
pub type Role = String;

/// Name of the transition whose target may be rerouted by the risk predicate
pub const START_TRANSITION: &str = "start";
/// Transition applied automatically when every review task is approved or skipped
pub const APPROVE_TRANSITION: &str = "approve";
/// Transition applied automatically when any review task is rejected
pub const REJECT_TRANSITION: &str = "reject";

// ============================================================================
// Enums
// ============================================================================

/// Operational lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses are never rewritten
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(EngineError::Validation(format!(
                "unknown workflow status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    ManualTask,
    HttpRequest,
    Webhook,
    NotifyUser,
    AiGenerate,
    ArticlePublish,
    ArticleReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Kinds of review task that gate the automatic approve/reject transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Approval,
    Legal,
    Seo,
    AiSafety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskDecision {
    Approved,
    Rejected,
    Skipped,
}

// ============================================================================
// Definition
// ============================================================================

/// A named, role-gated edge between two states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct Transition {
    pub from: StateName,
    pub to: StateName,
    /// Empty means any principal may apply the transition
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<String>))]
    pub required_roles: BTreeSet<Role>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            required_roles: BTreeSet::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct WorkflowGraph {
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<String>))]
    pub states: BTreeSet<StateName>,
    pub transitions: BTreeMap<String, Transition>,
    pub initial_state: StateName,
    /// Reaching one of these completes the run
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Vec<String>))]
    pub final_states: BTreeSet<StateName>,
    /// Review tasks opened on entry into a state
    #[serde(default)]
    pub review_tasks: BTreeMap<StateName, Vec<TaskType>>,
}

impl WorkflowGraph {
    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains(state)
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.final_states.contains(state)
    }

    pub fn review_tasks_for(&self, state: &str) -> &[TaskType] {
        self.review_tasks
            .get(state)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Copies `input[source]` to `target` before a step runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct InputMapping {
    /// Key or dotted path into the step context
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct StepSpec {
    pub id: String,
    pub order: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub input_mapping: Vec<InputMapping>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, order: u32, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            order,
            step_type,
            config: serde_json::Map::new(),
            input_mapping: vec![],
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_mapping(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.input_mapping.push(InputMapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }
}

/// Immutable-per-version description of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub content_type: String,
    pub active: bool,
    pub graph: WorkflowGraph,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Check that every state reference is a member of `graph.states`
    /// and that step orders are unique
    pub fn validate(&self) -> Result<(), EngineError> {
        let graph = &self.graph;
        let invalid = |msg: String| Err(EngineError::InvalidDefinition(msg));

        if !graph.has_state(&graph.initial_state) {
            return invalid(format!("initial state '{}' is not declared", graph.initial_state));
        }
        if let Some(state) = graph.final_states.iter().find(|s| !graph.has_state(s)) {
            return invalid(format!("final state '{}' is not declared", state));
        }
        for (name, transition) in &graph.transitions {
            for endpoint in [&transition.from, &transition.to] {
                if !graph.has_state(endpoint) {
                    return invalid(format!(
                        "transition '{}' references undeclared state '{}'",
                        name, endpoint
                    ));
                }
            }
        }
        if let Some(state) = graph.review_tasks.keys().find(|s| !graph.has_state(s)) {
            return invalid(format!("review tasks reference undeclared state '{}'", state));
        }

        let mut orders = BTreeSet::new();
        for step in &self.steps {
            if !orders.insert(step.order) {
                return invalid(format!("duplicate step order {}", step.order));
            }
        }
        Ok(())
    }

    /// Steps in ascending execution order
    pub fn ordered_steps(&self) -> Vec<&StepSpec> {
        let mut steps: Vec<&StepSpec> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }

    /// Whether the definition applies to a workspace (`None` = tenant-wide)
    pub fn applies_to_workspace(&self, workspace_id: Option<&str>) -> bool {
        match (&self.workspace_id, workspace_id) {
            (None, _) => true,
            (Some(own), Some(requested)) => own == requested,
            (Some(_), None) => false,
        }
    }
}

// ============================================================================
// Runtime records
// ============================================================================

/// One execution of a definition against a content entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub content_id: Option<i64>,
    pub tenant_id: String,
    pub workspace_id: Option<String>,
    pub state: StateName,
    pub status: WorkflowStatus,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub input: serde_json::Value,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub trigger_context: Option<serde_json::Value>,
}

/// Append-only record of one step attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct WorkflowStepExecution {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub order: u32,
    pub status: StepStatus,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub input: serde_json::Value,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowStepExecution {
    pub fn started(instance_id: Uuid, step: &StepSpec, input: serde_json::Value, retry_count: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step.id.clone(),
            order: step.order,
            status: StepStatus::Running,
            input,
            output: None,
            error_message: None,
            retry_count,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: StepStatus, output: Option<serde_json::Value>, error: Option<String>) {
        self.status = status;
        self.output = output;
        self.error_message = error;
        self.finished_at = Some(Utc::now());
    }
}

/// Human review gate opened on entry into a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ReviewTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub tenant_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub decision: Option<TaskDecision>,
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ReviewTask {
    pub fn open(instance: &WorkflowInstance, task_type: TaskType) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            tenant_id: instance.tenant_id.clone(),
            task_type,
            status: TaskStatus::Open,
            decision: None,
            decided_by: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Applied,
    Denied,
    Noop,
}

/// Immutable audit trail entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub actor: String,
    pub action: String,
    pub from_state: Option<StateName>,
    pub to_state: Option<StateName>,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        instance: &WorkflowInstance,
        actor: &ActorContext,
        action: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id: instance.tenant_id.clone(),
            instance_id: instance.id,
            actor: actor.actor_id.clone(),
            action: action.into(),
            from_state: None,
            to_state: None,
            outcome,
            detail: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_states(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from_state = Some(from.into());
        self.to_state = Some(to.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ============================================================================
// Callers and content
// ============================================================================

/// Role name carried by the engine's own automatic transitions
pub const SYSTEM_ROLE: &str = "system";

/// Acting principal, threaded explicitly through every call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub actor_id: String,
    pub tenant_id: String,
    pub workspace_id: Option<String>,
    pub roles: BTreeSet<Role>,
}

impl ActorContext {
    pub fn new(actor_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            tenant_id: tenant_id.into(),
            workspace_id: None,
            roles: BTreeSet::new(),
        }
    }

    /// Engine principal used for automatic transitions
    pub fn system(tenant_id: impl Into<String>) -> Self {
        Self::new("system", tenant_id).with_roles([SYSTEM_ROLE])
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn is_system(&self) -> bool {
        self.roles.contains(SYSTEM_ROLE)
    }
}

/// Content entity a run is started against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRef {
    pub id: i64,
    pub tenant_id: String,
    pub content_type: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_tenure_days: Option<u32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Payload of a `workflows:run` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJobPayload {
    pub workflow_instance_id: Uuid,
    pub tenant_id: String,
    #[serde(default)]
    pub step_index: Option<usize>,
}

impl RunJobPayload {
    /// Idempotency key for scheduling a step of an instance
    pub fn idempotency_key(&self) -> String {
        format!("run:{}:{}", self.workflow_instance_id, self.step_index.unwrap_or(0))
    }
}
