// Declared state tree
//
// ## State Value Model
//
// A machine declares its states as a tree of nodes:
//
// - **Atomic** nodes have no children.
// - **Compound** nodes have exactly one active child at a time and name an
//   initial child.
// - **Parallel** nodes have every region active at once.
//
// The *state value* stored in a snapshot mirrors the tree:
//
// ```text
// compound root, atomic child active     "idle"
// compound root, compound child active   {"generating": "streaming"}
// parallel root                          {"presence": "empty", "generation": "idle"}
// atomic region of a parallel node       {}
// ```
//
// Paths are dotted names from the root, e.g. `"generation.streaming"`.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::{LiveStateError, Result};

/// A node of the declared state tree
#[derive(Debug, Clone, PartialEq)]
pub enum StateNode {
    Atomic,
    Compound {
        initial: String,
        states: BTreeMap<String, StateNode>,
    },
    Parallel {
        regions: BTreeMap<String, StateNode>,
    },
}

impl StateNode {
    pub fn atomic() -> Self {
        StateNode::Atomic
    }

    pub fn compound<I, S>(initial: impl Into<String>, states: I) -> Self
    where
        I: IntoIterator<Item = (S, StateNode)>,
        S: Into<String>,
    {
        StateNode::Compound {
            initial: initial.into(),
            states: states.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn parallel<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = (S, StateNode)>,
        S: Into<String>,
    {
        StateNode::Parallel {
            regions: regions.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, StateNode::Atomic)
    }

    /// State value this node takes when entered without an explicit target
    pub fn initial_value(&self) -> Value {
        match self {
            StateNode::Atomic => Value::Object(Map::new()),
            StateNode::Compound { initial, states } => match states.get(initial) {
                Some(child) => Self::child_value(initial, child, child.initial_value()),
                None => Value::String(initial.clone()),
            },
            StateNode::Parallel { regions } => Value::Object(
                regions
                    .iter()
                    .map(|(name, region)| (name.clone(), region.initial_value()))
                    .collect(),
            ),
        }
    }

    /// Value of a compound node whose active child is `name`
    pub(crate) fn child_value(name: &str, child: &StateNode, child_value: Value) -> Value {
        if child.is_atomic() {
            Value::String(name.to_string())
        } else {
            let mut map = Map::new();
            map.insert(name.to_string(), child_value);
            Value::Object(map)
        }
    }

    /// Name and nested value of the active child of a compound state value
    pub(crate) fn active_child(value: &Value) -> Option<(&str, Option<&Value>)> {
        match value {
            Value::String(name) => Some((name.as_str(), None)),
            Value::Object(map) if map.len() == 1 => {
                map.iter().next().map(|(name, sub)| (name.as_str(), Some(sub)))
            }
            _ => None,
        }
    }

    /// Look up a node by dotted path
    pub fn find(&self, path: &str) -> Option<&StateNode> {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = match node {
                StateNode::Atomic => return None,
                StateNode::Compound { states, .. } => states.get(segment)?,
                StateNode::Parallel { regions } => regions.get(segment)?,
            };
        }
        Some(node)
    }

    /// Compute the state value after entering the dotted `target` path.
    ///
    /// Entering a child of a compound node replaces its active sibling; entering
    /// a path inside one parallel region leaves the other regions untouched. The
    /// targeted node itself starts from its initial value.
    pub fn enter(&self, current: &Value, target: &str) -> Result<Value> {
        let segments: Vec<&str> = target.split('.').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Ok(self.initial_value());
        }
        self.enter_segments(current, &segments, target)
    }

    fn enter_segments(&self, current: &Value, segments: &[&str], target: &str) -> Result<Value> {
        let Some((head, rest)) = segments.split_first() else {
            return Ok(self.initial_value());
        };

        match self {
            StateNode::Atomic => Err(unknown_target(target)),
            StateNode::Compound { states, .. } => {
                let child = states.get(*head).ok_or_else(|| unknown_target(target))?;
                let child_current = match Self::active_child(current) {
                    Some((name, Some(sub))) if name == *head => sub.clone(),
                    _ => child.initial_value(),
                };
                let next = if rest.is_empty() {
                    child.initial_value()
                } else {
                    child.enter_segments(&child_current, rest, target)?
                };
                Ok(Self::child_value(head, child, next))
            }
            StateNode::Parallel { regions } => {
                let region = regions.get(*head).ok_or_else(|| unknown_target(target))?;
                let mut map = Map::new();
                for (name, node) in regions {
                    let existing = current.get(name).cloned();
                    let value = if name == head {
                        if rest.is_empty() {
                            region.initial_value()
                        } else {
                            let base = existing.unwrap_or_else(|| region.initial_value());
                            region.enter_segments(&base, rest, target)?
                        }
                    } else {
                        existing.unwrap_or_else(|| node.initial_value())
                    };
                    map.insert(name.clone(), value);
                }
                Ok(Value::Object(map))
            }
        }
    }
}

fn unknown_target(target: &str) -> LiveStateError {
    LiveStateError::InvalidInput(format!("unknown state target: {}", target))
}

/// Check whether a dotted path is active in a state value.
///
/// A prefix of the active configuration matches too: `"generating"` matches
/// `{"generating": "streaming"}`.
pub fn state_matches(value: &Value, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let mut current = value;
    for (idx, segment) in segments.iter().enumerate() {
        match current {
            Value::String(name) => return name == segment && idx + 1 == segments.len(),
            Value::Object(map) => match map.get(*segment) {
                Some(next) => current = next,
                None => return false,
            },
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine() -> StateNode {
        StateNode::parallel([
            (
                "generation",
                StateNode::compound(
                    "idle",
                    [
                        ("idle", StateNode::atomic()),
                        (
                            "generating",
                            StateNode::compound(
                                "waiting",
                                [("waiting", StateNode::atomic()), ("streaming", StateNode::atomic())],
                            ),
                        ),
                        ("ready", StateNode::atomic()),
                    ],
                ),
            ),
            (
                "presence",
                StateNode::compound("empty", [("empty", StateNode::atomic()), ("occupied", StateNode::atomic())]),
            ),
        ])
    }

    #[test]
    fn test_initial_value() {
        assert_eq!(
            machine().initial_value(),
            json!({"generation": "idle", "presence": "empty"})
        );
    }

    #[test]
    fn test_enter_nested_keeps_other_regions() {
        let root = machine();
        let current = json!({"generation": "idle", "presence": "occupied"});
        let next = root.enter(&current, "generation.generating").unwrap();
        assert_eq!(
            next,
            json!({"generation": {"generating": "waiting"}, "presence": "occupied"})
        );

        let next = root.enter(&next, "generation.generating.streaming").unwrap();
        assert_eq!(
            next,
            json!({"generation": {"generating": "streaming"}, "presence": "occupied"})
        );
    }

    #[test]
    fn test_enter_unknown_target_fails() {
        let root = machine();
        assert!(root.enter(&root.initial_value(), "generation.flying").is_err());
    }

    #[test]
    fn test_matches_prefix_and_leaf() {
        let value = json!({"generation": {"generating": "streaming"}, "presence": "empty"});
        assert!(state_matches(&value, "generation.generating"));
        assert!(state_matches(&value, "generation.generating.streaming"));
        assert!(state_matches(&value, "presence.empty"));
        assert!(!state_matches(&value, "presence.occupied"));
        assert!(!state_matches(&value, "generation.idle"));
    }
}
