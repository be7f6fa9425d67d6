// Snapshot diffing
// RFC-6902 JSON-patch diffs between a connection's baseline and the current snapshot

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{LiveStateError, Result};

/// The message sent over a live socket for every non-empty diff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffMessage {
    pub operations: Patch,
}

impl DiffMessage {
    pub fn is_empty(&self) -> bool {
        self.operations.0.is_empty()
    }
}

/// Compute the patch that turns `baseline` into `current`.
///
/// A connection that has not seen any snapshot yet uses `Value::Null` as its
/// baseline; the resulting patch replaces the whole document.
pub fn diff_snapshots(baseline: &Value, current: &Value) -> DiffMessage {
    DiffMessage {
        operations: json_patch::diff(baseline, current),
    }
}

/// Apply a patch in place; the document is left untouched when any operation fails
pub fn apply_patch(doc: &mut Value, patch: &Patch) -> Result<()> {
    let mut next = doc.clone();
    json_patch::patch(&mut next, &patch.0)
        .map_err(|e| LiveStateError::InvalidInput(format!("patch does not apply: {}", e)))?;
    *doc = next;
    Ok(())
}

/// A local copy of an actor's snapshot kept current by applying diff messages.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMirror {
    value: Value,
    applied: usize,
}

impl SnapshotMirror {
    /// Start from the snapshot returned by the HTTP fetch
    pub fn new(baseline: Value) -> Self {
        Self {
            value: baseline,
            applied: 0,
        }
    }

    pub fn apply(&mut self, message: &DiffMessage) -> Result<&Value> {
        apply_patch(&mut self.value, &message.operations)?;
        self.applied += 1;
        Ok(&self.value)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Number of diff messages applied so far
    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_of_diffs_reproduces_current() {
        let s0 = json!({"value": "idle", "context": {"items": []}, "status": "active"});
        let s1 = json!({"value": "busy", "context": {"items": ["a"]}, "status": "active"});
        let s2 = json!({"value": "idle", "context": {"items": ["a", "b"], "done": true}, "status": "done"});

        let d1 = diff_snapshots(&s0, &s1);
        let d2 = diff_snapshots(&s1, &s2);

        let mut mirror = SnapshotMirror::new(s0);
        mirror.apply(&d1).unwrap();
        mirror.apply(&d2).unwrap();
        assert_eq!(mirror.value(), &s2);
        assert_eq!(mirror.applied(), 2);
    }

    #[test]
    fn test_identical_snapshots_produce_empty_diff() {
        let s = json!({"value": {"a": "x"}, "context": {}});
        assert!(diff_snapshots(&s, &s).is_empty());
    }

    #[test]
    fn test_null_baseline_replaces_document() {
        let current = json!({"value": "idle", "context": {}});
        let message = diff_snapshots(&Value::Null, &current);
        assert!(!message.is_empty());

        let mut doc = Value::Null;
        apply_patch(&mut doc, &message.operations).unwrap();
        assert_eq!(doc, current);
    }

    #[test]
    fn test_wire_shape() {
        let message = diff_snapshots(&json!({"a": 1}), &json!({"a": 2}));
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(
            wire,
            json!({"operations": [{"op": "replace", "path": "/a", "value": 2}]})
        );
    }

    #[test]
    fn test_failed_patch_leaves_document() {
        let mut doc = json!({"a": 1});
        let patch: Patch = serde_json::from_value(json!([
            {"op": "replace", "path": "/a", "value": 2},
            {"op": "remove", "path": "/missing"}
        ]))
        .unwrap();
        assert!(apply_patch(&mut doc, &patch).is_err());
        assert_eq!(doc, json!({"a": 1}));
    }
}
