// Schema validation for event bodies and structured model output
// Wraps a JSON Schema together with its deep-partial variant

use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::{Map, Value};

use crate::{LiveStateError, Result};

/// Keywords that make a value "incomplete" while it is still being streamed
const PARTIAL_DROPPED_KEYWORDS: &[&str] = &["required", "minItems", "minLength", "minProperties"];

/// A compiled JSON Schema and its deep-partial variant.
///
/// The partial variant accepts any prefix of a valid value: every property is
/// optional at every depth and arrays may be shorter than the minimum. It is
/// used to validate in-flight structured output.
#[derive(Clone)]
pub struct Schema {
    raw: Arc<Value>,
    full: Arc<JSONSchema>,
    partial: Arc<JSONSchema>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema").field("raw", &self.raw).finish()
    }
}

impl Schema {
    pub fn new(schema: Value) -> Result<Self> {
        let full = compile(&schema)?;
        let partial = compile(&deep_partial(&schema))?;
        Ok(Self {
            raw: Arc::new(schema),
            full: Arc::new(full),
            partial: Arc::new(partial),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Validate against the full schema, collecting every error message
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        match self.full.validate(value) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let messages: Vec<String> = errors
                    .map(|e| format!("{} at {}", e, e.instance_path))
                    .collect();
                Err(messages.join("; "))
            }
        }
    }

    /// Validate an inbound event body, failing with `InvalidEvent`
    pub fn validate_event(&self, body: &Value) -> Result<()> {
        self.validate(body).map_err(LiveStateError::InvalidEvent)
    }

    /// Check a possibly incomplete value against the deep-partial schema.
    ///
    /// Nulls are treated as absent fields, which is how a half-written YAML
    /// mapping (`name:` with nothing after it) decodes.
    pub fn validate_partial(&self, value: &Value) -> bool {
        self.partial.is_valid(&prune_nulls(value))
    }
}

fn compile(schema: &Value) -> Result<JSONSchema> {
    JSONSchema::compile(schema)
        .map_err(|e| LiveStateError::InvalidInput(format!("invalid schema: {}", e)))
}

/// Derive the deep-partial variant of a schema
pub fn deep_partial(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !PARTIAL_DROPPED_KEYWORDS.contains(&key.as_str()))
                .map(|(key, value)| match (key.as_str(), value) {
                    // property names are data, not keywords
                    ("properties", Value::Object(props)) => (
                        key.clone(),
                        Value::Object(
                            props
                                .iter()
                                .map(|(name, sub)| (name.clone(), deep_partial(sub)))
                                .collect(),
                        ),
                    ),
                    _ => (key.clone(), deep_partial(value)),
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(deep_partial).collect()),
        other => other.clone(),
    }
}

fn prune_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), prune_nulls(v)))
                .collect();
            Value::Object(pruned)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|v| !v.is_null())
                .map(prune_nulls)
                .collect(),
        ),
        other => other.clone(),
    }
}
