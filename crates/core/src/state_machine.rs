// Transition resolution and risk-adaptive routing
//
// Pure functions over a definition; the engine applies their results while
// holding the instance lock.

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::EngineError;
use crate::model::{ActorContext, ContentRef, StateName, Transition, WorkflowDefinition};

/// Look up `name` and check that it applies from `current_state`
pub fn resolve_transition<'a>(
    definition: &'a WorkflowDefinition,
    current_state: &str,
    name: &str,
) -> Result<&'a Transition, EngineError> {
    let transition = definition
        .graph
        .transitions
        .get(name)
        .ok_or_else(|| EngineError::UnknownTransition(name.to_string()))?;

    if transition.from != current_state {
        return Err(EngineError::InvalidTransition {
            transition: name.to_string(),
            state: current_state.to_string(),
        });
    }
    Ok(transition)
}

/// Whether the actor may apply the transition
///
/// An empty `required_roles` set is open to everyone. The engine's system
/// principal is always allowed.
pub fn authorize(transition: &Transition, actor: &ActorContext) -> bool {
    transition.required_roles.is_empty()
        || actor.is_system()
        || !transition.required_roles.is_disjoint(&actor.roles)
}

pub fn is_final(definition: &WorkflowDefinition, state: &str) -> bool {
    definition.graph.is_final(state)
}

// ============================================================================
// RiskPredicate - pluggable rerouting of the start transition
// ============================================================================

/// Facts available to a risk predicate
#[derive(Debug, Clone)]
pub struct RiskContext<'a> {
    pub definition: &'a WorkflowDefinition,
    pub content: Option<&'a ContentRef>,
    pub nominal_target: &'a str,
}

/// Decides whether a run must detour through a mitigation state
///
/// Evaluated synchronously on the `start` transition only, before the new
/// state is persisted.
pub trait RiskPredicate: Send + Sync + 'static {
    /// Mitigation state to enter instead of the nominal target, if any
    fn evaluate(&self, ctx: &RiskContext<'_>) -> Option<StateName>;
}

/// Never reroutes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRisk;

impl RiskPredicate for NoRisk {
    fn evaluate(&self, _ctx: &RiskContext<'_>) -> Option<StateName> {
        None
    }
}

/// Reroutes listed content types, optionally only for recent authors
#[derive(Debug, Clone)]
pub struct ContentTypeRiskRule {
    pub content_types: BTreeSet<String>,
    pub mitigation_state: StateName,
    /// Authors with at least this tenure are not rerouted
    pub min_author_tenure_days: Option<u32>,
}

impl ContentTypeRiskRule {
    pub fn new<I, S>(content_types: I, mitigation_state: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content_types: content_types.into_iter().map(Into::into).collect(),
            mitigation_state: mitigation_state.into(),
            min_author_tenure_days: None,
        }
    }

    pub fn with_min_author_tenure(mut self, days: u32) -> Self {
        self.min_author_tenure_days = Some(days);
        self
    }
}

impl RiskPredicate for ContentTypeRiskRule {
    fn evaluate(&self, ctx: &RiskContext<'_>) -> Option<StateName> {
        let content = ctx.content?;
        if !self.content_types.contains(&content.content_type) {
            return None;
        }
        if let Some(min) = self.min_author_tenure_days {
            // Unknown tenure counts as new
            if content.author_tenure_days.unwrap_or(0) >= min {
                return None;
            }
        }
        Some(self.mitigation_state.clone())
    }
}

/// Target state of the `start` transition after risk evaluation
///
/// A redirect to a state the definition does not declare is ignored.
pub fn route_start(
    predicate: &dyn RiskPredicate,
    definition: &WorkflowDefinition,
    content: Option<&ContentRef>,
    nominal_target: &str,
) -> StateName {
    let ctx = RiskContext {
        definition,
        content,
        nominal_target,
    };
    match predicate.evaluate(&ctx) {
        Some(state) if definition.graph.has_state(&state) => state,
        Some(state) => {
            warn!(
                definition_id = %definition.id,
                redirect = %state,
                "risk predicate redirected to undeclared state, using nominal target"
            );
            nominal_target.to_string()
        }
        None => nominal_target.to_string(),
    }
}
