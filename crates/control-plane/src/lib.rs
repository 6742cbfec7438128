// Conveyor Control Plane Library
// Decision: Shared library for binaries (API server, OpenAPI export) and integration tests

// HTTP action executor for automated steps
pub mod actions;

// API routes and types (shared for OpenAPI generation)
pub mod api;

// Router assembly (health, OpenAPI document, CORS, tracing)
pub mod app;

// Backend selection and service wiring
pub mod bootstrap;

// Environment and TOML configuration
pub mod config;

// OpenAPI spec generation
pub mod openapi;

pub use actions::HttpActionExecutor;
pub use app::{build_router, RouterConfig};
pub use bootstrap::{Backends, ServiceSettings, Services};
pub use config::AppConfig;
