// Actor snapshot
// The persisted and broadcast projection of a running actor

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// Lifecycle status of an actor snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    #[default]
    Active,
    Done,
    Error,
}

/// Serializable state value + context of an actor at a point in time.
///
/// `value` mirrors the declared state tree: a string names the active child of
/// a compound node whose child is atomic, an object maps the active child (or
/// every region of a parallel node) to its own nested value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub value: Value,
    pub context: Value,
    #[serde(default)]
    pub status: SnapshotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Snapshot {
    pub fn new(value: Value, context: Value) -> Self {
        Self {
            value,
            context,
            status: SnapshotStatus::Active,
            error: None,
        }
    }

    /// Check whether a dotted state path (e.g. `"generation.running"`) is active
    pub fn matches(&self, path: &str) -> bool {
        super::state::state_matches(&self.value, path)
    }

    pub fn is_active(&self) -> bool {
        self.status == SnapshotStatus::Active
    }

    /// JSON shape that is persisted and sent to clients
    pub fn to_persisted(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_persisted(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_persisted_shape_omits_missing_error() {
        let snapshot = Snapshot::new(json!("idle"), json!({"count": 1}));
        let persisted = snapshot.to_persisted().unwrap();
        assert_eq!(
            persisted,
            json!({"value": "idle", "context": {"count": 1}, "status": "active"})
        );
    }

    #[test]
    fn test_status_defaults_to_active() {
        let snapshot = Snapshot::from_persisted(json!({"value": "idle", "context": {}})).unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Active);
        assert!(snapshot.matches("idle"));
    }
}
