// Common DTOs and extractors for the admin API
//
// Errors are always `{code, message}`. Internal failures return a generic
// message; details only go to the log.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use conveyor_core::model::SYSTEM_ROLE;
use conveyor_core::{ActorContext, EngineError};
use conveyor_durable::{DlqError, StoreError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const WORKSPACE_HEADER: &str = "x-workspace-id";
pub const ACTOR_HEADER: &str = "x-actor-id";
pub const ROLES_HEADER: &str = "x-actor-roles";

/// Actor id used when the caller does not identify itself
const ANONYMOUS_ACTOR: &str = "anonymous";

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Stable machine-readable error code.
    #[schema(example = "INVALID_TRANSITION")]
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Error returned by every handler
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse::new(code, message),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal(error: impl std::fmt::Display) -> Self {
        tracing::error!("Internal error: {}", error);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", INTERNAL_ERROR_MESSAGE)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) | EngineError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            EngineError::UnknownTransition(_) => StatusCode::BAD_REQUEST,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidTransition { .. }
            | EngineError::Conflict(_)
            | EngineError::InstanceFinalized(_) => StatusCode::CONFLICT,
            EngineError::Internal(_) => return Self::internal(&err),
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<DlqError> for ApiError {
    fn from(err: DlqError) -> Self {
        match err {
            DlqError::NotFound(id) => Self::not_found(format!("dead-letter entry not found: {}", id)),
            DlqError::Store(e) => Self::from(e),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::internal(err)
    }
}

// ============================================================================
// Actor context from headers
// ============================================================================

/// Caller identity taken from request headers
///
/// `x-tenant-id` is required; `x-actor-roles` is comma-separated. The
/// engine's system role cannot be claimed through headers.
#[derive(Debug, Clone)]
pub struct Actor(pub ActorContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers).map(Actor)
    }
}

pub fn actor_from_headers(headers: &HeaderMap) -> Result<ActorContext, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let tenant_id = header(TENANT_HEADER)
        .ok_or_else(|| ApiError::validation(format!("missing {} header", TENANT_HEADER)))?;
    let actor_id = header(ACTOR_HEADER).unwrap_or(ANONYMOUS_ACTOR);

    let mut actor = ActorContext::new(actor_id, tenant_id);
    if let Some(workspace) = header(WORKSPACE_HEADER) {
        actor = actor.with_workspace(workspace);
    }
    if let Some(roles) = header(ROLES_HEADER) {
        actor = actor.with_roles(
            roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty() && *r != SYSTEM_ROLE),
        );
    }
    Ok(actor)
}

/// Response wrapper for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}
