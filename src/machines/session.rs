// Suggestion session
// Presence tracking plus a model-generated list of suggestions that survives restarts

//! # Session actor
//!
//! State tree (parallel root):
//!
//! - `presence`: `empty` | `occupied`, driven by socket connect/disconnect
//! - `generation`: `idle` → `generating` → `done` | `failed`
//!
//! A `submit {topic}` event starts a cached token stream run keyed by a fresh
//! run id. The decoder feeds `suggestions.start|progress|complete|error` back
//! into the actor, so `context.suggestions` fills in while the model is still
//! writing. When a persisted session is restored mid-run, `resume` re-attaches
//! to the replay cache instead of calling the model again.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::actor::ActorRef;
use crate::engine::machine::{MachineDefinition, Transition};
use crate::engine::schema::Schema;
use crate::engine::storage::ChunkStore;
use crate::llm::decoder::{deliver, DecoderEvent, StreamingDecoder};
use crate::llm::stream_source::{attach, StreamPrompt, StreamSourceConfig, TokenStreamSource};
use crate::llm::LLMProviderClient;
use crate::models::{StateNode, CONNECT_EVENT, DISCONNECT_EVENT, RESUME_EVENT};
use crate::{LiveStateError, Result};

pub const SESSION_ACTOR_TYPE: &str = "session";

/// Prefix of the decoder events delivered into a session
const DECODER_PREFIX: &str = "suggestions";

/// What a session needs to run generations
#[derive(Clone)]
pub struct SessionServices {
    pub provider: Arc<dyn LLMProviderClient>,
    pub chunks: Arc<dyn ChunkStore>,
    pub stream: StreamSourceConfig,
}

/// Asks for `{suggestions: [{name, description}]}` as a fenced YAML block
pub struct SuggestionPrompt;

impl StreamPrompt for SuggestionPrompt {
    type Input = String;

    fn system_message(&self, _topic: &String) -> String {
        [
            "You suggest ideas. Reply with a single fenced YAML block and nothing else:",
            "```yaml",
            "suggestions:",
            "  - name: <short name>",
            "    description: <one sentence>",
            "```",
            "Give between three and five suggestions.",
        ]
        .join("\n")
    }

    fn user_message(&self, topic: &String) -> String {
        format!("Topic: {}", topic)
    }

    fn temperature(&self) -> f32 {
        0.8
    }

    fn max_tokens(&self) -> u32 {
        1024
    }
}

fn suggestions_schema() -> Result<Schema> {
    Schema::new(json!({
        "type": "object",
        "required": ["suggestions"],
        "properties": {
            "suggestions": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["name", "description"],
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "description": {"type": "string"}
                    }
                }
            }
        }
    }))
}

fn events_schema() -> Result<Schema> {
    Schema::new(json!({
        "type": "object",
        "required": ["type", "topic"],
        "properties": {
            "type": {"enum": ["submit"]},
            "topic": {"type": "string", "minLength": 1, "maxLength": 500}
        }
    }))
}

/// Run a generation into the replay cache and feed the decoded results to `actor`
async fn generate(services: SessionServices, schema: Schema, actor: ActorRef, topic: String, run_id: String) {
    let source = TokenStreamSource::new(SuggestionPrompt, services.provider.clone())
        .with_cache(services.chunks.clone(), run_id.clone())
        .with_config(services.stream.clone());

    match source.get_stream(&topic).await {
        Ok(chunks) => {
            let events = StreamingDecoder::new(schema).decode(chunks);
            deliver(events, actor, DECODER_PREFIX.to_string()).await;
        }
        Err(e) => {
            warn!("Generation {} could not start: {}", run_id, e);
            let failed = DecoderEvent::Error {
                raw: String::new(),
                reason: e.to_string(),
            };
            if let Err(e) = actor.send(failed.into_actor_event(DECODER_PREFIX)) {
                warn!("Session {} is gone: {}", actor.id(), e);
            }
        }
    }
}

/// Re-attach to an interrupted run; start it over if it never reached the cache
async fn reattach(services: SessionServices, schema: Schema, actor: ActorRef, topic: String, run_id: String) {
    match attach(services.chunks.clone(), &run_id, &services.stream).await {
        Ok(Some(chunks)) => {
            info!("Session {} re-attached to run {}", actor.id(), run_id);
            let events = StreamingDecoder::new(schema).decode(chunks);
            deliver(events, actor, DECODER_PREFIX.to_string()).await;
        }
        Ok(None) => generate(services, schema, actor, topic, run_id).await,
        Err(e) => {
            let failed = DecoderEvent::Error {
                raw: String::new(),
                reason: format!("replay cache unavailable: {}", e),
            };
            if let Err(e) = actor.send(failed.into_actor_event(DECODER_PREFIX)) {
                warn!("Session {} is gone: {}", actor.id(), e);
            }
        }
    }
}

fn spawn_on_runtime<F>(task: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|e| LiveStateError::Internal(format!("no runtime for generation: {}", e)))?;
    handle.spawn(task);
    Ok(())
}

fn from_system(event: &crate::models::ActorEvent) -> bool {
    event.caller.as_ref().map(|c| c.is_system()).unwrap_or(false)
}

/// Build the `session` actor type
pub fn session_machine(services: SessionServices) -> Result<MachineDefinition> {
    let schema = suggestions_schema()?;
    let root = StateNode::parallel([
        (
            "presence",
            StateNode::compound(
                "empty",
                [("empty", StateNode::atomic()), ("occupied", StateNode::atomic())],
            ),
        ),
        (
            "generation",
            StateNode::compound(
                "idle",
                [
                    ("idle", StateNode::atomic()),
                    ("generating", StateNode::atomic()),
                    ("done", StateNode::atomic()),
                    ("failed", StateNode::atomic()),
                ],
            ),
        ),
    ]);

    let submit_services = services.clone();
    let submit_schema = schema.clone();
    let resume_services = services;
    let resume_schema = schema;

    MachineDefinition::builder(SESSION_ACTOR_TYPE, root)
        .context(|input| {
            json!({
                "topic": input.get("topic").cloned().unwrap_or(Value::Null),
                "suggestions": [],
                "runId": null,
                "error": null,
                "online": []
            })
        })
        .default_context(json!({
            "topic": null,
            "suggestions": [],
            "runId": null,
            "error": null,
            "online": []
        }))
        .rename("generation.running", "generation.generating")
        .events(events_schema()?)
        .on(
            "submit",
            Transition::new()
                .guard(|snapshot, _| !snapshot.matches("generation.generating"))
                .to("generation.generating")
                .action(move |scope| {
                    let topic = scope
                        .event
                        .get_str("topic")
                        .map(str::to_string)
                        .ok_or_else(|| LiveStateError::InvalidEvent("submit needs a topic".to_string()))?;
                    let run_id = format!("{}:{}", scope.actor.id(), Uuid::new_v4());

                    scope.context["topic"] = json!(topic);
                    scope.context["runId"] = json!(run_id);
                    scope.context["suggestions"] = json!([]);
                    scope.context["error"] = Value::Null;

                    spawn_on_runtime(generate(
                        submit_services.clone(),
                        submit_schema.clone(),
                        scope.actor.clone(),
                        topic,
                        run_id,
                    ))
                }),
        )
        .on(
            RESUME_EVENT,
            Transition::new().from("generation.generating").action(move |scope| {
                let (Some(topic), Some(run_id)) = (
                    scope.context["topic"].as_str().map(str::to_string),
                    scope.context["runId"].as_str().map(str::to_string),
                ) else {
                    return Err(LiveStateError::Internal(
                        "generating without a topic or run id".to_string(),
                    ));
                };
                spawn_on_runtime(reattach(
                    resume_services.clone(),
                    resume_schema.clone(),
                    scope.actor.clone(),
                    topic,
                    run_id,
                ))
            }),
        )
        .on(
            "suggestions.progress",
            Transition::new()
                .from("generation.generating")
                .guard(|_, event| from_system(event))
                .action(|scope| {
                    if let Some(items) = scope.event.get("value").and_then(|v| v.get("suggestions")) {
                        scope.context["suggestions"] = items.clone();
                    }
                    Ok(())
                }),
        )
        .on(
            "suggestions.complete",
            Transition::new()
                .from("generation.generating")
                .guard(|_, event| from_system(event))
                .to("generation.done")
                .action(|scope| {
                    if let Some(items) = scope.event.get("value").and_then(|v| v.get("suggestions")) {
                        scope.context["suggestions"] = items.clone();
                    }
                    Ok(())
                }),
        )
        .on(
            "suggestions.error",
            Transition::new()
                .from("generation.generating")
                .guard(|_, event| from_system(event))
                .to("generation.failed")
                .action(|scope| {
                    scope.context["error"] = scope.event.get("reason").cloned().unwrap_or(Value::Null);
                    Ok(())
                }),
        )
        .on(
            CONNECT_EVENT,
            Transition::new().to("presence.occupied").action(|scope| {
                if let (Some(caller), Some(online)) =
                    (scope.event.caller.as_ref(), scope.context["online"].as_array_mut())
                {
                    online.push(json!(caller.id));
                }
                Ok(())
            }),
        )
        .on(
            DISCONNECT_EVENT,
            Transition::new()
                .guard(|snapshot, event| online_after_leave(snapshot, event) == 0)
                .to("presence.empty")
                .action(leave),
        )
        .on(DISCONNECT_EVENT, Transition::new().action(leave))
        .try_build()
}

fn online_after_leave(snapshot: &crate::models::Snapshot, event: &crate::models::ActorEvent) -> usize {
    let online = snapshot.context["online"].as_array().map(Vec::len).unwrap_or(0);
    let present = event
        .caller
        .as_ref()
        .map(|c| snapshot.context["online"].as_array().map(|ids| ids.contains(&json!(c.id))).unwrap_or(false))
        .unwrap_or(false);
    if present {
        online - 1
    } else {
        online
    }
}

/// Remove one entry of the leaving caller from `online`
fn leave(scope: &mut crate::engine::machine::ActionScope<'_>) -> Result<()> {
    let Some(caller) = scope.event.caller.as_ref() else {
        return Ok(());
    };
    if let Some(online) = scope.context["online"].as_array_mut() {
        if let Some(index) = online.iter().position(|id| id == &json!(caller.id)) {
            online.remove(index);
        }
    }
    Ok(())
}
