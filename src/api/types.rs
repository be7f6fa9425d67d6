// HTTP and socket API types
// Query strings and JSON bodies of the actor routes

use serde::{Deserialize, Serialize};

/// `GET /{actorType}/{id}?input=<json>`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchQuery {
    /// JSON-encoded input, used only when the actor is created by this request
    pub input: Option<String>,
}

/// `?token=<connection token>` on the socket route and on event posts
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Response to an accepted event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventAccepted {
    pub status: String,
}

impl EventAccepted {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Error body for every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub actor_types: Vec<String>,
    pub rooms: usize,
    pub timestamp: String,
}
