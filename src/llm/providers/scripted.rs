//! In-process provider that replays a fixed list of text chunks

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::llm::traits::{ChunkStream, LLMProviderClient};
use crate::llm::{ChunkDelta, LLMError, LLMRequest, LLMResult, StreamingChoice, StreamingChunk};

/// Replays `chunks` as one streamed completion, optionally pausing between
/// chunks or failing part-way through
#[derive(Clone)]
pub struct ScriptedClient {
    chunks: Vec<String>,
    delay: Duration,
    fail_after: Option<usize>,
    requests: Arc<Mutex<Vec<LLMRequest>>>,
}

impl ScriptedClient {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            fail_after: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pause before every chunk
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Yield a network error after `n` chunks instead of finishing
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<LLMRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn chunk(index: usize, text: String) -> StreamingChunk {
        StreamingChunk {
            id: format!("scripted-{}", index),
            model: "scripted".to_string(),
            choices: vec![StreamingChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some(text),
                },
                finish_reason: None,
            }],
        }
    }
}

#[async_trait]
impl LLMProviderClient for ScriptedClient {
    async fn chat_completion_stream(&self, request: LLMRequest) -> LLMResult<ChunkStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let state = (self.chunks.clone().into_iter().enumerate(), self.delay, self.fail_after);
        let stream = futures::stream::unfold(state, |(mut chunks, delay, fail_after)| async move {
            let (index, text) = chunks.next()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let item = match fail_after {
                Some(limit) if index >= limit => {
                    // end the stream after reporting the failure
                    let ended = Vec::new().into_iter().enumerate();
                    return Some((
                        Err(LLMError::Network("scripted failure".to_string())),
                        (ended, delay, None),
                    ));
                }
                _ => Ok(Self::chunk(index, text)),
            };
            Some((item, (chunks, delay, fail_after)))
        });

        Ok(Box::new(Box::pin(stream)))
    }

    fn default_model(&self) -> String {
        "scripted".to_string()
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}
