//! Structured output decoding over a chunk stream
//!
//! Every chunk is appended to a buffer; the buffer is sanitized, decoded as
//! YAML and checked against the deep-partial schema. Failures while the run is
//! in flight are expected and only suppress a `progress` event. Once the source
//! ends, the same decode is checked against the full schema and yields exactly
//! one `complete` or `error`.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::actor::ActorRef;
use crate::engine::schema::Schema;
use crate::llm::sanitize::sanitize;
use crate::llm::stream_source::TextStream;
use crate::models::{ActorEvent, Caller};

/// What the decoder reports about a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DecoderEvent {
    Start,
    Progress { value: Value },
    Complete { value: Value },
    /// `raw` is the whole accumulated text
    Error { raw: String, reason: String },
}

impl DecoderEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DecoderEvent::Start => "start",
            DecoderEvent::Progress { .. } => "progress",
            DecoderEvent::Complete { .. } => "complete",
            DecoderEvent::Error { .. } => "error",
        }
    }

    /// `{prefix}.{kind}` actor event from a system caller
    pub fn into_actor_event(self, prefix: &str) -> ActorEvent {
        let event = ActorEvent::new(format!("{}.{}", prefix, self.kind()))
            .with_caller(Caller::system("decoder"));
        match self {
            DecoderEvent::Start => event,
            DecoderEvent::Progress { value } | DecoderEvent::Complete { value } => {
                event.with("value", value)
            }
            DecoderEvent::Error { raw, reason } => event
                .with("raw", Value::String(raw))
                .with("reason", Value::String(reason)),
        }
    }
}

pub struct StreamingDecoder {
    schema: Schema,
    buffer: String,
    started: bool,
    finished: bool,
    last_partial: Option<Value>,
}

impl StreamingDecoder {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            buffer: String::new(),
            started: false,
            finished: false,
            last_partial: None,
        }
    }

    /// Text received so far
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one chunk; never fails
    pub fn push(&mut self, chunk: &str) -> Vec<DecoderEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.started {
            self.started = true;
            events.push(DecoderEvent::Start);
        }
        self.buffer.push_str(chunk);

        if let Ok(value) = decode(&self.buffer) {
            if self.schema.validate_partial(&value) && self.last_partial.as_ref() != Some(&value) {
                self.last_partial = Some(value.clone());
                events.push(DecoderEvent::Progress { value });
            }
        }
        events
    }

    /// Validate the accumulated text against the full schema
    pub fn finish(&mut self) -> Option<DecoderEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;

        let verdict = decode(&self.buffer).and_then(|value| {
            self.schema
                .validate(&value)
                .map(|_| value)
                .map_err(|reason| format!("schema: {}", reason))
        });
        Some(match verdict {
            Ok(value) => DecoderEvent::Complete { value },
            Err(reason) => {
                warn!("Structured output rejected: {}", reason);
                DecoderEvent::Error {
                    raw: self.buffer.clone(),
                    reason,
                }
            }
        })
    }

    /// End the run because the source failed
    pub fn fail(&mut self, reason: impl Into<String>) -> Option<DecoderEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(DecoderEvent::Error {
            raw: self.buffer.clone(),
            reason: reason.into(),
        })
    }

    /// Decode a whole chunk stream into events
    pub fn decode(self, chunks: TextStream) -> BoxStream<'static, DecoderEvent> {
        struct State {
            decoder: StreamingDecoder,
            chunks: TextStream,
            pending: VecDeque<DecoderEvent>,
        }

        let state = State {
            decoder: self,
            chunks,
            pending: VecDeque::new(),
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.decoder.is_finished() {
                    return None;
                }
                match state.chunks.next().await {
                    Some(Ok(chunk)) => state.pending.extend(state.decoder.push(&chunk)),
                    Some(Err(e)) => state.pending.extend(state.decoder.fail(format!("source: {}", e))),
                    None => state.pending.extend(state.decoder.finish()),
                }
            }
        })
        .boxed()
    }
}

fn decode(raw: &str) -> Result<Value, String> {
    serde_yaml::from_str::<Value>(&sanitize(raw)).map_err(|e| format!("yaml: {}", e))
}

/// Deliver decoder events into an actor as `{prefix}.start|progress|complete|error`
pub async fn deliver<S>(events: S, actor: ActorRef, prefix: String)
where
    S: Stream<Item = DecoderEvent> + Send,
{
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        debug!("Delivering {}.{} to {}", prefix, event.kind(), actor.id());
        if let Err(e) = actor.send(event.into_actor_event(&prefix)) {
            warn!("Dropping decoder output for {}: {}", actor.id(), e);
            break;
        }
    }
}

/// Decode `chunks` in the background and feed the results to `actor`
pub fn spawn_into_actor(
    schema: Schema,
    chunks: TextStream,
    actor: ActorRef,
    prefix: impl Into<String>,
) -> JoinHandle<()> {
    let events = StreamingDecoder::new(schema).decode(chunks);
    tokio::spawn(deliver(events, actor, prefix.into()))
}
