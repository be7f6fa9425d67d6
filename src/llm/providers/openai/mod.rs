//! OpenAI-compatible provider
//! Works against api.openai.com or any self-hosted endpoint exposing `/chat/completions`

pub mod client;
pub mod config;
pub mod types;

pub use client::OpenAIClient;
pub use config::OpenAIConfig;

/// Create an OpenAI client from environment variables
pub fn create_client_from_env() -> Result<OpenAIClient, String> {
    OpenAIConfig::from_env().map(OpenAIClient::new)
}
