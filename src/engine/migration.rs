// Snapshot migrations
// Reconcile a persisted snapshot with a machine definition that may have changed shape

//! # Migrations
//!
//! A persisted snapshot was written by whatever machine definition was
//! deployed at the time. Before it is fed to the current definition, the host
//! computes a list of JSON-patch operations that bring it in line:
//!
//! - **State value**: walked against the declared tree. An atomic child that
//!   became compound is expanded to its initial value, a compound child that
//!   became atomic is collapsed to its name, missing parallel regions are added
//!   with their initial value and undeclared ones are dropped. A state that no
//!   longer exists is resolved through the machine's rename rules; if no rule
//!   covers it the migration fails for the whole room.
//! - **Context**: fields of the declared default context that the snapshot
//!   lacks are added. Existing fields are never overwritten.
//! - **Status**: a snapshot written before statuses existed becomes `active`.
//!
//! Generation only reads; [`apply_migrations`] applies the operations. Both are
//! deterministic, and a migrated snapshot yields no further operations.

use json_patch::{Patch, PatchOperation};
use serde_json::{Map, Value};
use tracing::debug;

use crate::engine::machine::MachineDefinition;
use crate::models::StateNode;
use crate::{LiveStateError, Result};

/// Compute the operations that migrate `persisted` onto `machine`
pub fn generate_migrations(machine: &MachineDefinition, persisted: &Value) -> Result<Patch> {
    let migrated = migrate(machine, persisted)?;
    let patch = json_patch::diff(persisted, &migrated);
    if !patch.0.is_empty() {
        debug!(
            "Generated {} migration operation(s) for {}",
            patch.0.len(),
            machine.actor_type()
        );
    }
    Ok(patch)
}

/// Apply migration operations to a persisted snapshot.
///
/// A `remove` whose target is already gone is skipped, so applying the same
/// operations to an already-migrated snapshot leaves it unchanged.
pub fn apply_migrations(persisted: &Value, migrations: &Patch) -> Result<Value> {
    let mut doc = persisted.clone();
    for op in &migrations.0 {
        if let PatchOperation::Remove(remove) = op {
            if doc.pointer(&remove.path).is_none() {
                continue;
            }
        }
        json_patch::patch(&mut doc, std::slice::from_ref(op)).map_err(|e| {
            LiveStateError::Migration {
                path: operation_path(op).to_string(),
                reason: e.to_string(),
            }
        })?;
    }
    Ok(doc)
}

fn operation_path(op: &PatchOperation) -> &str {
    match op {
        PatchOperation::Add(op) => &op.path,
        PatchOperation::Remove(op) => &op.path,
        PatchOperation::Replace(op) => &op.path,
        PatchOperation::Move(op) => &op.path,
        PatchOperation::Copy(op) => &op.path,
        PatchOperation::Test(op) => &op.path,
    }
}

fn migrate(machine: &MachineDefinition, persisted: &Value) -> Result<Value> {
    let Value::Object(snapshot) = persisted else {
        return Err(migration_error("", "persisted snapshot is not an object"));
    };
    let mut migrated = snapshot.clone();

    let value = snapshot
        .get("value")
        .ok_or_else(|| migration_error("value", "persisted snapshot has no state value"))?;
    let mut reconciler = Reconciler {
        renames: machine.renames(),
        pending: Vec::new(),
    };
    let mut next = reconciler.reconcile(machine.root(), value, "")?;
    for target in reconciler.pending {
        debug!("Migrating renamed state into {}", target);
        next = machine.root().enter(&next, &target)?;
    }
    migrated.insert("value".to_string(), next);

    let context = match snapshot.get("context") {
        Some(Value::Object(existing)) => {
            let mut context = existing.clone();
            if let Value::Object(defaults) = machine.default_context() {
                for (key, default) in defaults {
                    if !context.contains_key(key) {
                        context.insert(key.clone(), default.clone());
                    }
                }
            }
            Value::Object(context)
        }
        Some(Value::Null) | None => machine.default_context().clone(),
        Some(_) => return Err(migration_error("context", "context is not an object")),
    };
    migrated.insert("context".to_string(), context);

    if !migrated.contains_key("status") {
        migrated.insert("status".to_string(), Value::String("active".to_string()));
    }

    Ok(Value::Object(migrated))
}

struct Reconciler<'a> {
    renames: &'a [(String, String)],
    /// Rename targets to enter once the rest of the value is reconciled
    pending: Vec<String>,
}

impl Reconciler<'_> {
    fn rename_target(&self, path: &str) -> Option<String> {
        self.renames
            .iter()
            .find(|(from, _)| from == path)
            .map(|(_, to)| to.clone())
    }

    fn reconcile(&mut self, node: &StateNode, value: &Value, path: &str) -> Result<Value> {
        match node {
            StateNode::Atomic => Ok(Value::Object(Map::new())),
            StateNode::Compound { states, .. } => {
                // an atomic region that grew children
                if value.as_object().map_or(false, Map::is_empty) {
                    return Ok(node.initial_value());
                }
                let (name, sub) = StateNode::active_child(value).ok_or_else(|| {
                    migration_error(path, "expected exactly one active child state")
                })?;
                let child_path = join(path, name);

                let Some(child) = states.get(name) else {
                    let target = self.rename_target(&child_path).ok_or_else(|| {
                        migration_error(&child_path, "state no longer exists and no rename covers it")
                    })?;
                    self.pending.push(target);
                    return Ok(node.initial_value());
                };

                let child_value = match (child, sub) {
                    (StateNode::Atomic, _) => Value::Object(Map::new()),
                    (_, Some(sub)) => self.reconcile(child, sub, &child_path)?,
                    (_, None) => child.initial_value(),
                };
                Ok(StateNode::child_value(name, child, child_value))
            }
            StateNode::Parallel { regions } => match value {
                Value::Object(current) => {
                    for key in current.keys().filter(|k| !regions.contains_key(*k)) {
                        if let Some(target) = self.rename_target(&join(path, key)) {
                            self.pending.push(target);
                        }
                    }

                    let mut next = Map::new();
                    for (name, region) in regions {
                        let region_value = match current.get(name) {
                            Some(existing) => self.reconcile(region, existing, &join(path, name))?,
                            None => region.initial_value(),
                        };
                        next.insert(name.clone(), region_value);
                    }
                    Ok(Value::Object(next))
                }
                Value::String(name) => {
                    let old_path = join(path, name);
                    let target = self.rename_target(&old_path).ok_or_else(|| {
                        migration_error(&old_path, "state no longer exists and no rename covers it")
                    })?;
                    self.pending.push(target);
                    Ok(node.initial_value())
                }
                _ => Err(migration_error(path, "expected parallel regions")),
            },
        }
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn migration_error(path: &str, reason: &str) -> LiveStateError {
    LiveStateError::Migration {
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::machine::MachineDefinition;
    use serde_json::json;

    fn machine() -> MachineDefinition {
        MachineDefinition::builder(
            "session",
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
                            ("done", StateNode::atomic()),
                        ],
                    ),
                ),
                (
                    "presence",
                    StateNode::compound("empty", [("empty", StateNode::atomic()), ("occupied", StateNode::atomic())]),
                ),
            ]),
        )
        .default_context(json!({"suggestions": [], "callers": {}}))
        .rename("generation.running", "generation.generating.streaming")
        .build()
    }

    fn migrated(persisted: &Value) -> Value {
        let m = machine();
        let ops = generate_migrations(&m, persisted).unwrap();
        apply_migrations(persisted, &ops).unwrap()
    }

    #[test]
    fn test_current_snapshot_needs_no_migration() {
        let persisted = json!({
            "value": {"generation": {"generating": "streaming"}, "presence": "occupied"},
            "context": {"suggestions": [], "callers": {}},
            "status": "active"
        });
        assert!(generate_migrations(&machine(), &persisted).unwrap().0.is_empty());
    }

    #[test]
    fn test_adds_regions_context_and_status() {
        let persisted = json!({
            "value": {"generation": "idle", "legacy": "on"},
            "context": {"suggestions": [{"name": "A"}]}
        });
        assert_eq!(
            migrated(&persisted),
            json!({
                "value": {"generation": "idle", "presence": "empty"},
                "context": {"suggestions": [{"name": "A"}], "callers": {}},
                "status": "active"
            })
        );
    }

    #[test]
    fn test_expands_and_collapses_children() {
        let persisted = json!({
            "value": {"generation": "generating", "presence": {"occupied": "x"}},
            "context": {}
        });
        assert_eq!(
            migrated(&persisted)["value"],
            json!({"generation": {"generating": "waiting"}, "presence": "occupied"})
        );
    }

    #[test]
    fn test_follows_renames() {
        let persisted = json!({
            "value": {"generation": "running", "presence": "empty"},
            "context": {}
        });
        assert_eq!(
            migrated(&persisted)["value"],
            json!({"generation": {"generating": "streaming"}, "presence": "empty"})
        );
    }

    #[test]
    fn test_unknown_state_is_fatal() {
        let persisted = json!({
            "value": {"generation": "teleporting", "presence": "empty"},
            "context": {}
        });
        let err = generate_migrations(&machine(), &persisted).unwrap_err();
        match err {
            LiveStateError::Migration { path, .. } => assert_eq!(path, "generation.teleporting"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let persisted = json!({
            "value": {"generation": "running", "legacy": "x"},
            "context": {"suggestions": [1]}
        });
        let m = machine();
        let ops = generate_migrations(&m, &persisted).unwrap();
        let once = apply_migrations(&persisted, &ops).unwrap();
        let twice = apply_migrations(&once, &ops).unwrap();
        assert_eq!(once, twice);
        assert!(generate_migrations(&m, &once).unwrap().0.is_empty());
    }
}
