// HTTP handlers for actor rooms

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use tracing::debug;

use super::tokens::bearer_token;
use super::types::{ErrorResponse, EventAccepted, FetchQuery, HealthResponse, TokenQuery};
use super::ApiState;
use crate::engine::host::{CallerCredentials, FetchedSnapshot};
use crate::{LiveStateError, Result};

/// Credentials from `Authorization: Bearer` and, failing that, `?token=`
pub(crate) fn credentials(headers: &HeaderMap, query_token: Option<String>) -> CallerCredentials {
    let access_token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);
    CallerCredentials {
        connection_token: if access_token.is_none() { query_token } else { None },
        access_token,
    }
}

/// `GET /:actor_type/:id`
pub async fn fetch_snapshot(
    State(state): State<ApiState>,
    Path((actor_type, id)): Path<(String, String)>,
    Query(query): Query<FetchQuery>,
    headers: HeaderMap,
) -> Result<Json<FetchedSnapshot>> {
    let input = match query.input.as_deref() {
        None | Some("") => Value::Null,
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| LiveStateError::InvalidInput(format!("input is not JSON: {}", e)))?,
    };

    let host = state.hub.host(&actor_type, &id)?;
    let creds = credentials(&headers, None);
    let fetched = host.fetch_snapshot(&creds, &input).await?;
    Ok(Json(fetched))
}

/// `POST /:actor_type/:id`
pub async fn submit_event(
    State(state): State<ApiState>,
    Path((actor_type, id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<EventAccepted>> {
    let event: Value = serde_json::from_slice(&body)
        .map_err(|e| LiveStateError::InvalidEvent(format!("body is not JSON: {}", e)))?;

    let host = state.hub.host(&actor_type, &id)?;
    let creds = credentials(&headers, query.token);
    host.submit_event(&creds, event).await?;
    debug!("Accepted event for {}:{}", actor_type, id);
    Ok(Json(EventAccepted::ok()))
}

/// `GET /healthz`
pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        actor_types: state.hub.actor_types(),
        rooms: state.hub.room_count(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "The requested resource was not found".to_string(),
            code: "not_found".to_string(),
        }),
    )
}
