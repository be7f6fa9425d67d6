// Machine definitions
// A declared state tree plus a handler table keyed by event `type`

//! # Machine Definitions
//!
//! A [`MachineDefinition`] is everything the host needs to run one actor type:
//!
//! - the declared [`StateNode`] tree
//! - a context factory, called with the caller-supplied input on first access
//! - a handler table: for each event `type`, an ordered list of
//!   [`Transition`]s. The first transition whose source matches the current
//!   state and whose guard passes is taken; the others are ignored.
//! - the ready condition `fetch_snapshot` waits for
//! - the event schema inbound client events are validated against
//! - migration hints: default context fields and explicit state renames
//!
//! ```ignore
//! let machine = MachineDefinition::builder("counter", StateNode::compound("idle", [...]))
//!     .context(|_input| json!({"count": 0}))
//!     .on("increment", Transition::new().action(|scope| {
//!         let count = scope.context["count"].as_i64().unwrap_or(0);
//!         scope.context["count"] = json!(count + 1);
//!         Ok(())
//!     }))
//!     .build();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::engine::actor::ActorRef;
use crate::engine::schema::Schema;
use crate::models::{ActorEvent, Snapshot, SnapshotStatus, StateNode};
use crate::{LiveStateError, Result};

/// What an action can see and change while a transition is taken
pub struct ActionScope<'a> {
    pub context: &'a mut Value,
    pub event: &'a ActorEvent,
    /// State value before the transition
    pub state: &'a Value,
    /// Handle for sending follow-up events or spawning work that reports back
    pub actor: &'a ActorRef,
}

pub type Action = Arc<dyn Fn(&mut ActionScope<'_>) -> Result<()> + Send + Sync>;
pub type Guard = Arc<dyn Fn(&Snapshot, &ActorEvent) -> bool + Send + Sync>;
type ContextFactory = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type ReadyCondition = Arc<dyn Fn(&Snapshot) -> bool + Send + Sync>;

/// One entry of the handler table
#[derive(Clone, Default)]
pub struct Transition {
    from: Option<String>,
    to: Option<String>,
    guard: Option<Guard>,
    actions: Vec<Action>,
}

impl Transition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only take this transition while `path` is active
    pub fn from(mut self, path: impl Into<String>) -> Self {
        self.from = Some(path.into());
        self
    }

    /// Enter `path` after the actions ran; without a target the state value is kept
    pub fn to(mut self, path: impl Into<String>) -> Self {
        self.to = Some(path.into());
        self
    }

    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn(&Snapshot, &ActorEvent) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ActionScope<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(action));
        self
    }

    fn applies(&self, snapshot: &Snapshot, event: &ActorEvent) -> bool {
        let source_ok = self
            .from
            .as_deref()
            .map_or(true, |path| snapshot.matches(path));
        source_ok && self.guard.as_ref().map_or(true, |guard| guard(snapshot, event))
    }
}

/// An actor type: state tree, handler table and host-facing hooks
pub struct MachineDefinition {
    actor_type: String,
    root: StateNode,
    context_factory: ContextFactory,
    default_context: Value,
    handlers: HashMap<String, Vec<Transition>>,
    ready: ReadyCondition,
    event_schema: Option<Schema>,
    renames: Vec<(String, String)>,
    final_states: Vec<String>,
}

impl std::fmt::Debug for MachineDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineDefinition")
            .field("actor_type", &self.actor_type)
            .field("root", &self.root)
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MachineDefinition {
    pub fn builder(actor_type: impl Into<String>, root: StateNode) -> MachineBuilder {
        MachineBuilder {
            machine: MachineDefinition {
                actor_type: actor_type.into(),
                root,
                context_factory: Arc::new(|_| Value::Object(Default::default())),
                default_context: Value::Object(Default::default()),
                handlers: HashMap::new(),
                ready: Arc::new(|_| true),
                event_schema: None,
                renames: Vec::new(),
                final_states: Vec::new(),
            },
        }
    }

    pub fn actor_type(&self) -> &str {
        &self.actor_type
    }

    pub fn root(&self) -> &StateNode {
        &self.root
    }

    pub fn default_context(&self) -> &Value {
        &self.default_context
    }

    pub fn renames(&self) -> &[(String, String)] {
        &self.renames
    }

    pub fn event_schema(&self) -> Option<&Schema> {
        self.event_schema.as_ref()
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Snapshot of a freshly constructed actor
    pub fn initial_snapshot(&self, input: &Value) -> Snapshot {
        Snapshot::new(self.root.initial_value(), (self.context_factory)(input))
    }

    pub fn is_ready(&self, snapshot: &Snapshot) -> bool {
        (self.ready)(snapshot)
    }

    /// Apply one event.
    ///
    /// Returns `Ok(None)` when no transition is registered for the event or none
    /// applies in the current state. Actions run against a copy of the context,
    /// so a failing action leaves `snapshot` untouched.
    pub fn transition(
        &self,
        snapshot: &Snapshot,
        event: &ActorEvent,
        actor: &ActorRef,
    ) -> Result<Option<Snapshot>> {
        let Some(candidates) = self.handlers.get(&event.kind) else {
            return Ok(None);
        };
        let Some(transition) = candidates.iter().find(|t| t.applies(snapshot, event)) else {
            return Ok(None);
        };

        let mut context = snapshot.context.clone();
        {
            let mut scope = ActionScope {
                context: &mut context,
                event,
                state: &snapshot.value,
                actor,
            };
            for action in &transition.actions {
                action(&mut scope)?;
            }
        }

        let value = match &transition.to {
            Some(target) => self.root.enter(&snapshot.value, target)?,
            None => snapshot.value.clone(),
        };

        let mut next = Snapshot::new(value, context);
        if self.final_states.iter().any(|path| next.matches(path)) {
            next.status = SnapshotStatus::Done;
        }
        Ok(Some(next))
    }
}

/// Builder for [`MachineDefinition`]
pub struct MachineBuilder {
    machine: MachineDefinition,
}

impl MachineBuilder {
    /// Build the initial context from the input supplied on first access
    pub fn context<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.machine.context_factory = Arc::new(factory);
        self
    }

    /// Context fields migrations add to persisted snapshots that lack them
    pub fn default_context(mut self, defaults: Value) -> Self {
        self.machine.default_context = defaults;
        self
    }

    pub fn on(mut self, event_type: impl Into<String>, transition: Transition) -> Self {
        self.machine
            .handlers
            .entry(event_type.into())
            .or_default()
            .push(transition);
        self
    }

    /// Condition `fetch_snapshot` waits for before answering
    pub fn ready<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Snapshot) -> bool + Send + Sync + 'static,
    {
        self.machine.ready = Arc::new(condition);
        self
    }

    pub fn events(mut self, schema: Schema) -> Self {
        self.machine.event_schema = Some(schema);
        self
    }

    /// Persisted state `from` (dotted path) now lives at `to`
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.machine.renames.push((from.into(), to.into()));
        self
    }

    /// Entering `path` marks the snapshot `done`
    pub fn final_state(mut self, path: impl Into<String>) -> Self {
        self.machine.final_states.push(path.into());
        self
    }

    pub fn build(self) -> MachineDefinition {
        self.machine
    }

    /// Build, rejecting handler targets that name no declared state
    pub fn try_build(self) -> Result<MachineDefinition> {
        let machine = self.machine;
        for (event, transitions) in &machine.handlers {
            for transition in transitions {
                for path in transition.from.iter().chain(transition.to.iter()) {
                    if machine.root.find(path).is_none() {
                        return Err(LiveStateError::InvalidInput(format!(
                            "handler for `{}` names unknown state `{}`",
                            event, path
                        )));
                    }
                }
            }
        }
        for (from, to) in &machine.renames {
            if machine.root.find(to).is_none() {
                return Err(LiveStateError::InvalidInput(format!(
                    "rename `{}` targets unknown state `{}`",
                    from, to
                )));
            }
        }
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::actor::ActorRef;
    use serde_json::json;

    fn toggle() -> MachineDefinition {
        MachineDefinition::builder(
            "toggle",
            StateNode::compound("off", [("off", StateNode::atomic()), ("on", StateNode::atomic())]),
        )
        .context(|input| json!({"flips": 0, "label": input.get("label").cloned().unwrap_or(Value::Null)}))
        .on(
            "flip",
            Transition::new().from("off").to("on").action(|scope| {
                let flips = scope.context["flips"].as_i64().unwrap_or(0);
                scope.context["flips"] = json!(flips + 1);
                Ok(())
            }),
        )
        .on("flip", Transition::new().from("on").to("off"))
        .on(
            "fail",
            Transition::new().action(|_| Err(LiveStateError::Internal("boom".into()))),
        )
        .on(
            "guarded",
            Transition::new()
                .guard(|_, event| event.get_str("key") == Some("open"))
                .to("on"),
        )
        .build()
    }

    #[test]
    fn test_initial_snapshot_uses_input() {
        let snapshot = toggle().initial_snapshot(&json!({"label": "lamp"}));
        assert_eq!(snapshot.value, json!("off"));
        assert_eq!(snapshot.context, json!({"flips": 0, "label": "lamp"}));
    }

    #[tokio::test]
    async fn test_first_matching_transition_wins() {
        let machine = toggle();
        let actor = ActorRef::detached("t1");
        let s0 = machine.initial_snapshot(&Value::Null);

        let s1 = machine
            .transition(&s0, &ActorEvent::new("flip"), &actor)
            .unwrap()
            .unwrap();
        assert_eq!(s1.value, json!("on"));
        assert_eq!(s1.context["flips"], json!(1));

        let s2 = machine
            .transition(&s1, &ActorEvent::new("flip"), &actor)
            .unwrap()
            .unwrap();
        assert_eq!(s2.value, json!("off"));
        assert_eq!(s2.context["flips"], json!(1));
    }

    #[tokio::test]
    async fn test_unhandled_and_guarded_events() {
        let machine = toggle();
        let actor = ActorRef::detached("t1");
        let s0 = machine.initial_snapshot(&Value::Null);

        assert!(machine
            .transition(&s0, &ActorEvent::new("unknown"), &actor)
            .unwrap()
            .is_none());
        assert!(machine
            .transition(&s0, &ActorEvent::new("guarded"), &actor)
            .unwrap()
            .is_none());

        let opened = machine
            .transition(
                &s0,
                &ActorEvent::new("guarded").with("key", json!("open")),
                &actor,
            )
            .unwrap()
            .unwrap();
        assert!(opened.matches("on"));
    }

    #[tokio::test]
    async fn test_failing_action_is_an_error() {
        let machine = toggle();
        let actor = ActorRef::detached("t1");
        let s0 = machine.initial_snapshot(&Value::Null);
        assert!(machine
            .transition(&s0, &ActorEvent::new("fail"), &actor)
            .is_err());
    }

    #[test]
    fn test_try_build_rejects_unknown_targets() {
        let result = MachineDefinition::builder("x", StateNode::compound("a", [("a", StateNode::atomic())]))
            .on("go", Transition::new().to("b"))
            .try_build();
        assert!(result.is_err());
    }
}
