//! OpenAI-compatible streaming client

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client,
};
use std::time::Duration;
use tracing::{debug, error};

use crate::llm::sse::{openai::openai_event_to_chunk, response_to_sse_stream};
use crate::llm::traits::{ChunkStream, LLMProviderClient};
use crate::llm::{LLMError, LLMRequest, LLMResult};

use super::config::OpenAIConfig;
use super::types::{OpenAIError, OpenAIRequest};

pub struct OpenAIClient {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIClient {
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self::new(OpenAIConfig {
            api_key: api_key.into(),
            ..OpenAIConfig::default()
        })
    }

    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    fn build_headers(&self) -> LLMResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| LLMError::Internal(format!("Invalid API key format: {}", e)))?,
        );

        if let Some(org) = &self.config.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org)
                    .map_err(|e| LLMError::Internal(format!("Invalid organization format: {}", e)))?,
            );
        }

        for (key, value) in &self.config.custom_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| LLMError::Internal(format!("Invalid header key: {}", e)))?;
            headers.insert(
                name,
                HeaderValue::from_str(value)
                    .map_err(|e| LLMError::Internal(format!("Invalid header value: {}", e)))?,
            );
        }

        Ok(headers)
    }

    fn convert_request(&self, request: &LLMRequest) -> OpenAIRequest {
        let model = if request.model.is_empty() {
            self.config.default_model.clone()
        } else {
            request.model.clone()
        };
        OpenAIRequest {
            model,
            messages: request.messages.iter().map(Into::into).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        }
    }

    fn handle_error_response(status_code: u16, error_text: &str) -> LLMError {
        let message = serde_json::from_str::<OpenAIError>(error_text)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| error_text.to_string());
        match status_code {
            401 | 403 => LLMError::AuthenticationFailed(message),
            429 => LLMError::RateLimitExceeded(message),
            400 | 404 | 422 => LLMError::InvalidRequest(message),
            _ => LLMError::Internal(format!("HTTP {}: {}", status_code, message)),
        }
    }
}

#[async_trait]
impl LLMProviderClient for OpenAIClient {
    async fn chat_completion_stream(&self, request: LLMRequest) -> LLMResult<ChunkStream> {
        let headers = self.build_headers()?;
        let body = self.convert_request(&request);
        let url = self.config.completions_url();

        debug!("Streaming completion: URL={}, Model={}", url, body.model);

        // The timeout covers the response head only; the body streams unbounded
        let pending = self.client.post(&url).headers(headers).json(&body).send();
        let response = tokio::time::timeout(Duration::from_secs(self.config.timeout_seconds), pending)
            .await
            .map_err(|_| LLMError::Timeout(format!("no response from {} in {}s", url, self.config.timeout_seconds)))?
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Completion API error: {} - {}", status, error_text);
            return Err(Self::handle_error_response(status.as_u16(), &error_text));
        }

        let chunks = response_to_sse_stream(response).filter_map(|event| async move {
            match event {
                Ok(event) => openai_event_to_chunk(&event).transpose(),
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::new(Box::pin(chunks)))
    }

    fn default_model(&self) -> String {
        self.config.default_model.clone()
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[test]
    fn test_convert_request_uses_default_model() {
        let client = OpenAIClient::with_api_key("test-key");
        let request = LLMRequest {
            model: String::new(),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.2),
            max_tokens: None,
            stream: true,
        };

        let body = client.convert_request(&request);
        assert_eq!(body.model, client.default_model());
        assert!(body.stream);
        assert_eq!(body.messages[0].role, "user");

        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn test_error_mapping() {
        let body = r#"{"error":{"message":"bad key","type":"invalid_request_error","code":null}}"#;
        assert!(matches!(
            OpenAIClient::handle_error_response(401, body),
            LLMError::AuthenticationFailed(m) if m == "bad key"
        ));
        assert!(matches!(
            OpenAIClient::handle_error_response(429, "slow down"),
            LLMError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            OpenAIClient::handle_error_response(502, "gateway"),
            LLMError::Internal(_)
        ));
    }
}
