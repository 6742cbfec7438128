// Workflow Engine
//
// This crate provides a storage-agnostic workflow engine for content
// pipelines: a state machine over declared states and transitions, human
// review tasks, and ordered automated steps executed by queue workers.
//
// Key design decisions:
// - Uses traits (WorkflowStore, ActionExecutor, PolicyGate, RiskPredicate) for pluggable backends
// - An instance's graph `state` and run `status` are separate fields
// - All instance mutations happen under the per-instance distributed lock
// - Queue writes happen only after the owning store transaction commits
// - Step execution records are append-only; terminal instances are never rewritten

pub mod actions;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod runner;
pub mod state_machine;
pub mod store;

// Logging initialization shared by binaries
pub mod telemetry;

// In-memory implementations for examples and testing
pub mod memory;

// Re-exports for convenience
pub use actions::{ActionExecutor, ActionOutcome, StepExecutor, StepOutcome};
pub use engine::{EngineConfig, RunRequest, WorkflowEngine};
pub use error::{ActionError, EngineError, Result, WorkflowStoreError};
pub use memory::InMemoryWorkflowStore;
pub use model::{
    ActorContext, AuditOutcome, AuditRecord, ContentRef, InputMapping, ReviewTask, RunJobPayload,
    StepSpec, StepStatus, StepType, TaskDecision, TaskStatus, TaskType, Transition,
    WorkflowDefinition, WorkflowGraph, WorkflowInstance, WorkflowStatus, WorkflowStepExecution,
};
pub use policy::{AllowAll, PolicyDecision, PolicyGate};
pub use runner::WorkflowRunner;
pub use state_machine::{ContentTypeRiskRule, NoRisk, RiskContext, RiskPredicate};
pub use store::{InstanceFilter, Page, PageRequest, WorkflowStore, WorkflowTx};
pub use telemetry::{init_telemetry, TelemetryConfig};
