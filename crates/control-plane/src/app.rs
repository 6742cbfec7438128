// HTTP application assembly
//
// Health and the OpenAPI document are never prefixed; admin routes are
// mounted under the optional API prefix.

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::api;
use crate::api::common::{ACTOR_HEADER, ROLES_HEADER, TENANT_HEADER, WORKSPACE_HEADER};
use crate::openapi::ApiDoc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Settings for the HTTP surface
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Example: "/api" results in routes like /api/workflows/instances
    pub api_prefix: String,
    /// Browser origins allowed by CORS; empty means same-origin only
    pub cors_origins: Vec<String>,
}

/// Build the full application router
pub fn build_router(
    workflows_state: api::workflows::AppState,
    queues_state: api::queues::AppState,
    config: &RouterConfig,
) -> Router {
    let api_routes = Router::new()
        .merge(api::workflows::routes(workflows_state))
        .merge(api::queues::routes(queues_state));

    let app = Router::new()
        .route("/health", get(health))
        .route("/api-doc/openapi.json", get(openapi_json))
        .merge(build_router_with_prefix(api_routes, &config.api_prefix));

    let cors_origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    // Add CORS layer only if origins are configured
    let app = if cors_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
        app
    } else {
        tracing::info!(origins = ?cors_origins, "CORS origins configured");
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    header::ORIGIN,
                    HeaderName::from_static(TENANT_HEADER),
                    HeaderName::from_static(WORKSPACE_HEADER),
                    HeaderName::from_static(ACTOR_HEADER),
                    HeaderName::from_static(ROLES_HEADER),
                ])
                .allow_credentials(true),
        )
    };

    app.layer(TraceLayer::new_for_http())
}

/// Build router with optional API prefix (extracted for testing)
fn build_router_with_prefix<S: Clone + Send + Sync + 'static>(
    api_routes: Router<S>,
    api_prefix: &str,
) -> Router<S> {
    if api_prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(api_prefix, api_routes)
    }
}
