// Actor HTTP/socket API
// Snapshot fetch, event submission and the live diff socket for every registered actor type

pub mod client;
pub mod handlers;
pub mod tokens;
pub mod types;
pub mod websocket;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::engine::hub::ActorHub;
use crate::LiveStateError;
use types::ErrorResponse;

/// Shared state of every route
#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<ActorHub>,
}

/// Router serving every actor type registered on `hub`:
///
/// - `GET  /healthz`
/// - `GET  /:actor_type/:id?input=<json>` fetch snapshot + connection token
/// - `POST /:actor_type/:id` submit an event
/// - `GET  /:actor_type/:id/socket?token=<connection token>` live diffs
pub fn create_router(hub: Arc<ActorHub>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route(
            "/:actor_type/:id",
            get(handlers::fetch_snapshot).post(handlers::submit_event),
        )
        .route("/:actor_type/:id/socket", get(websocket::socket_handler))
        .fallback(handlers::not_found)
        .with_state(ApiState { hub })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

impl LiveStateError {
    /// HTTP status and machine-readable code of this error
    pub fn status_code(&self) -> (StatusCode, &'static str) {
        match self {
            LiveStateError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            LiveStateError::InvalidEvent(_) => (StatusCode::BAD_REQUEST, "invalid_event"),
            LiveStateError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            LiveStateError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            LiveStateError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            LiveStateError::Migration { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "migration_failed"),
            LiveStateError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            LiveStateError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error"),
            LiveStateError::Llm(_) => (StatusCode::INTERNAL_SERVER_ERROR, "llm_error"),
            LiveStateError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for LiveStateError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod api_tests;
