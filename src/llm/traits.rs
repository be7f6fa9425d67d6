//! Common traits for LLM providers
//! This module defines the interface every streaming provider implements

use async_trait::async_trait;

use super::{LLMRequest, LLMResult, StreamingChunk};

/// A provider's streaming response
pub type ChunkStream = Box<dyn futures::Stream<Item = LLMResult<StreamingChunk>> + Send + Unpin>;

/// Core trait that all LLM provider clients must implement
#[async_trait]
pub trait LLMProviderClient: Send + Sync {
    /// Send a streaming chat completion request
    async fn chat_completion_stream(&self, request: LLMRequest) -> LLMResult<ChunkStream>;

    /// Model used when a prompt does not name one
    fn default_model(&self) -> String;

    /// Short provider name for logs
    fn provider_name(&self) -> &'static str;
}
