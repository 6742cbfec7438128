// Policy gate consulted before every instance mutation
//
// Tenant/RBAC policy evaluation lives outside the engine; only the call is
// made here.

use async_trait::async_trait;

use crate::model::ActorContext;

/// Actions checked against the gate
pub mod actions {
    pub const START: &str = "workflow.start";
    pub const TRANSITION: &str = "workflow.transition";
    pub const COMPLETE_TASK: &str = "workflow.complete_task";
    pub const CANCEL: &str = "workflow.cancel";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

/// External yes/no authorization
#[async_trait]
pub trait PolicyGate: Send + Sync + 'static {
    /// `resource` is an opaque identifier, e.g. `workflow_instance:{id}`
    async fn check(&self, actor: &ActorContext, action: &str, resource: &str) -> PolicyDecision;
}

/// Allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PolicyGate for AllowAll {
    async fn check(&self, _actor: &ActorContext, _action: &str, _resource: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}
