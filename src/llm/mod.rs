//! LLM streaming and structured-output decoding
//!
//! This module turns a chat completion call into an async sequence of text
//! chunks and turns that sequence into validated structured values:
//!
//! - `traits` / `providers`: the provider interface and an OpenAI-compatible
//!   streaming client (plus a scripted in-process provider)
//! - `sse`: `text/event-stream` parsing for provider responses
//! - `stream_source`: completion call as a chunk stream, optionally replicated
//!   into the replay cache so other consumers can attach to the same run
//! - `sanitize` / `decoder`: extract the YAML payload from the accumulated
//!   text, decode it and validate it against a schema as chunks arrive

pub mod decoder;
pub mod providers;
pub mod sanitize;
pub mod sse;
pub mod stream_source;
pub mod traits;

use serde::{Deserialize, Serialize};

pub use traits::{ChunkStream, LLMProviderClient};

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// LLM Request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// Streaming response chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingChunk {
    pub id: String,
    pub model: String,
    pub choices: Vec<StreamingChoice>,
}

impl StreamingChunk {
    /// Text delta of the first choice, empty when the chunk carries none
    pub fn text(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.delta.content.as_deref())
            .unwrap_or_default()
    }
}

/// Streaming choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub role: Option<MessageRole>,
    pub content: Option<String>,
}

/// Error types for LLM operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for LLM operations
pub type LLMResult<T> = Result<T, LLMError>;
