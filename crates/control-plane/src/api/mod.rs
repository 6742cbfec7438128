// HTTP API routes
//
// This module contains the admin route handlers. Each submodule handles a
// specific resource type with its own AppState.

pub mod common;
pub mod queues;
pub mod workflows;

// Re-export common types
pub use common::{Actor, ApiError, ErrorResponse, ListResponse};
