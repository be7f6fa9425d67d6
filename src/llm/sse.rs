//! Server-Sent Events parsing for streaming completions
//!
//! Providers answer a streaming request with a `text/event-stream` body. The
//! parser here reassembles events across network reads; the `openai` module
//! turns `data:` payloads into [`StreamingChunk`]s.

use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::llm::{LLMError, LLMResult, StreamingChunk};

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq)]
pub struct SSEEvent {
    pub event_type: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE parser; bytes that do not yet form a full event are kept
#[derive(Debug, Default)]
pub struct SSEParser {
    buffer: String,
}

impl SSEParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, get back every event completed by them
    pub fn parse_chunk(&mut self, chunk: &[u8]) -> LLMResult<Vec<SSEEvent>> {
        let text = std::str::from_utf8(chunk)
            .map_err(|e| LLMError::Parse(format!("Invalid UTF-8 in SSE stream: {}", e)))?;
        // CRLF framing is legal; normalize so the boundary search is uniform
        self.buffer.push_str(&text.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = Self::parse_block(&block) {
                events.push(event);
            }
        }

        if !events.is_empty() {
            debug!(
                "Parsed {} SSE events, {} bytes buffered",
                events.len(),
                self.buffer.len()
            );
        }
        Ok(events)
    }

    fn parse_block(block: &str) -> Option<SSEEvent> {
        let mut event_type = None;
        let mut id = None;
        let mut data = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event_type = Some(value.to_string()),
                "data" => data.push(value),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        if data.is_empty() && event_type.is_none() {
            return None;
        }
        Some(SSEEvent {
            event_type,
            data: data.join("\n"),
            id,
        })
    }

    pub fn has_remaining_data(&self) -> bool {
        !self.buffer.trim().is_empty()
    }

    /// Parse whatever is left once the body ended without a final blank line
    pub fn finish(&mut self) -> Option<SSEEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            None
        } else {
            Self::parse_block(&rest)
        }
    }
}

/// Convert a reqwest Response into an SSE event stream
pub fn response_to_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = LLMResult<SSEEvent>> + Send + Unpin {
    bytes_to_sse_stream(response.bytes_stream().map(|r| r.map_err(|e| LLMError::Network(e.to_string()))))
}

/// Parse any byte stream as SSE, flushing a trailing unterminated event
pub fn bytes_to_sse_stream<S, B>(bytes: S) -> impl Stream<Item = LLMResult<SSEEvent>> + Send + Unpin
where
    S: Stream<Item = LLMResult<B>> + Send + 'static,
    B: AsRef<[u8]>,
{
    let state = (Box::pin(bytes), SSEParser::new(), false);
    Box::pin(
        futures::stream::unfold(state, |(mut bytes, mut parser, ended)| async move {
            if ended {
                return None;
            }
            let batch = match bytes.next().await {
                Some(Ok(chunk)) => match parser.parse_chunk(chunk.as_ref()) {
                    Ok(events) => events.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                },
                Some(Err(e)) => vec![Err(e)],
                None => {
                    if parser.has_remaining_data() {
                        warn!("SSE body ended without a blank line; flushing last event");
                    }
                    let last: Vec<LLMResult<SSEEvent>> = parser.finish().into_iter().map(Ok).collect();
                    return Some((last, (bytes, parser, true)));
                }
            };
            Some((batch, (bytes, parser, false)))
        })
        .flat_map(futures::stream::iter),
    )
}

/// OpenAI-compatible chunk payloads
pub mod openai {
    use super::*;
    use crate::llm::{ChunkDelta, MessageRole, StreamingChoice};
    use serde::Deserialize;

    pub const DONE_MARKER: &str = "[DONE]";

    #[derive(Debug, Deserialize)]
    pub struct OpenAIStreamChunk {
        #[serde(default)]
        pub id: String,
        #[serde(default)]
        pub model: String,
        #[serde(default)]
        pub choices: Vec<OpenAIStreamChoice>,
    }

    #[derive(Debug, Deserialize)]
    pub struct OpenAIStreamChoice {
        #[serde(default)]
        pub index: u32,
        #[serde(default)]
        pub delta: OpenAIDelta,
        pub finish_reason: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct OpenAIDelta {
        pub role: Option<String>,
        pub content: Option<String>,
    }

    /// `Ok(None)` for keep-alives and the terminal `[DONE]` marker
    pub fn openai_event_to_chunk(event: &SSEEvent) -> LLMResult<Option<StreamingChunk>> {
        let data = event.data.trim();
        if data.is_empty() || data == DONE_MARKER {
            return Ok(None);
        }

        let chunk: OpenAIStreamChunk = serde_json::from_str(data)
            .map_err(|e| LLMError::Parse(format!("Failed to parse stream chunk: {}", e)))?;

        let choices = chunk
            .choices
            .into_iter()
            .map(|choice| StreamingChoice {
                index: choice.index,
                delta: ChunkDelta {
                    role: choice.delta.role.as_deref().map(|role| match role {
                        "system" => MessageRole::System,
                        "user" => MessageRole::User,
                        _ => MessageRole::Assistant,
                    }),
                    content: choice.delta.content,
                },
                finish_reason: choice.finish_reason,
            })
            .collect();

        Ok(Some(StreamingChunk {
            id: chunk.id,
            model: chunk.model,
            choices,
        }))
    }
}
