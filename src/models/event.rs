// Actor events
// Opaque, type-tagged payloads routed into a machine's handler table

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Caller;
use crate::{LiveStateError, Result};

/// Sent by the host when a socket attaches, carrying the caller and connection id
pub const CONNECT_EVENT: &str = "connect";

/// Sent by the host when a socket closes
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Sent by the host after a persisted snapshot was restored
pub const RESUME_EVENT: &str = "resume";

/// Event types only the host may produce
pub const RESERVED_EVENT_TYPES: &[&str] = &[CONNECT_EVENT, DISCONNECT_EVENT, RESUME_EVENT];

/// An event delivered to an actor.
///
/// The `type` discriminant selects the handlers; every other field of the
/// inbound body travels untouched in `payload`. The host tags the event with
/// the resolved caller and, for socket traffic, the connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<Caller>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl ActorEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
            caller: None,
            connection_id: None,
        }
    }

    /// Build an event from an inbound JSON body that already passed the event schema.
    ///
    /// Any `caller` or `connection_id` smuggled in the body is discarded; those
    /// fields are only ever set by the host.
    pub fn from_body(body: Value, caller: Caller, connection_id: Option<String>) -> Result<Self> {
        let mut payload = match body {
            Value::Object(map) => map,
            other => {
                return Err(LiveStateError::InvalidEvent(format!(
                    "event body must be an object, got {}",
                    other
                )))
            }
        };

        let kind = match payload.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => {
                return Err(LiveStateError::InvalidEvent(
                    "event body is missing a string `type`".to_string(),
                ))
            }
        };

        if RESERVED_EVENT_TYPES.contains(&kind.as_str()) {
            return Err(LiveStateError::InvalidEvent(format!(
                "event type `{}` is reserved",
                kind
            )));
        }

        payload.remove("caller");
        payload.remove("connection_id");

        Ok(Self {
            kind,
            payload,
            caller: Some(caller),
            connection_id,
        })
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
