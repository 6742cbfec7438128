// Error types for the workflow engine

use thiserror::Error;
use uuid::Uuid;

use conveyor_durable::{LockError, QueueError};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors from a [`crate::store::WorkflowStore`]
#[derive(Debug, Error)]
pub enum WorkflowStoreError {
    /// Record not found (or not visible to the tenant)
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Write against an instance whose persisted status is terminal
    #[error("workflow instance {0} is finalized")]
    InstanceFinalized(Uuid),

    /// Write against a step execution that already reached a terminal status
    #[error("step execution {0} is immutable")]
    ExecutionImmutable(Uuid),

    /// Backend error (database, network, etc.)
    #[error("workflow store backend error: {0}")]
    Backend(String),
}

impl WorkflowStoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Infrastructure fault while invoking an action executor
///
/// An action that ran and reported failure is an `ActionOutcome`, not an error.
#[derive(Debug, Error)]
pub enum ActionError {
    /// Executor could not be reached
    #[error("action executor unavailable: {0}")]
    Unavailable(String),

    /// Call exceeded its time bound
    #[error("action timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors surfaced by the workflow engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Current state does not match the transition's source
    #[error("transition '{transition}' is not valid from state '{state}'")]
    InvalidTransition { transition: String, state: String },

    /// Transition name is not part of the definition
    #[error("unknown transition '{0}'")]
    UnknownTransition(String),

    /// Role mismatch or policy denial
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Instance lock is held elsewhere
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Instance status is terminal
    #[error("workflow instance {0} is finalized")]
    InstanceFinalized(Uuid),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// Malformed request input
    #[error("validation error: {0}")]
    Validation(String),

    /// Infrastructure failure; details are logged, not returned
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::UnknownTransition(_) => "UNKNOWN_TRANSITION",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InstanceFinalized(_) => "INSTANCE_FINALIZED",
            Self::InvalidDefinition(_) => "INVALID_DEFINITION",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<WorkflowStoreError> for EngineError {
    fn from(err: WorkflowStoreError) -> Self {
        match err {
            WorkflowStoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            WorkflowStoreError::InstanceFinalized(id) => Self::InstanceFinalized(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = EngineError::InvalidTransition {
            transition: "approve".to_string(),
            state: "DRAFT".to_string(),
        };
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(EngineError::Conflict("locked".into()).code(), "CONFLICT");
        assert_eq!(EngineError::internal("db down").code(), "INTERNAL");
    }

    #[test]
    fn test_store_errors_map_to_engine_errors() {
        let id = Uuid::now_v7();
        let err: EngineError = WorkflowStoreError::InstanceFinalized(id).into();
        assert!(matches!(err, EngineError::InstanceFinalized(x) if x == id));

        let err: EngineError = WorkflowStoreError::not_found("instance", id).into();
        assert_eq!(err.code(), "NOT_FOUND");

        let err: EngineError = WorkflowStoreError::Backend("timeout".into()).into();
        assert_eq!(err.code(), "INTERNAL");
    }
}
