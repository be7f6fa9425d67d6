//! OpenAI-compatible provider configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Connection settings for any endpoint speaking the chat completions protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub default_model: String,
    /// Seconds to wait for response headers; the body may stream for longer
    pub timeout_seconds: u64,
    pub custom_headers: HashMap<String, String>,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            default_model: DEFAULT_MODEL.to_string(),
            timeout_seconds: 30,
            custom_headers: HashMap::new(),
        }
    }
}

impl OpenAIConfig {
    /// Read `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_ORGANIZATION` and
    /// `OPENAI_DEFAULT_MODEL`; only the key is required
    pub fn from_env() -> Result<Self, String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| "OPENAI_API_KEY environment variable not found".to_string())?;

        let mut config = Self {
            api_key,
            ..Self::default()
        };
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("OPENAI_DEFAULT_MODEL") {
            config.default_model = model;
        }
        config.organization = std::env::var("OPENAI_ORGANIZATION").ok();
        Ok(config)
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completions_url_ignores_trailing_slash() {
        let config = OpenAIConfig {
            base_url: "http://localhost:8000/v1/".to_string(),
            ..OpenAIConfig::default()
        };
        assert_eq!(config.completions_url(), "http://localhost:8000/v1/chat/completions");
    }
}
