// Running actors
// One task per actor applies events to its snapshot strictly one at a time

//! # Actor Runtime
//!
//! An [`Actor`] is a spawned task that owns one [`Snapshot`] and a mailbox.
//! Events are taken from the mailbox in arrival order and applied through the
//! machine's handler table; no two events of the same actor are ever applied
//! concurrently.
//!
//! After every transition the new snapshot is published on a `watch` channel
//! (connection listeners diff against it) and, when persistence is enabled,
//! written to the snapshot store. Persistence is best-effort: a failed write is
//! logged and the actor keeps serving from memory.
//!
//! An action that rejects its event with `InvalidEvent` leaves the snapshot
//! untouched. Any other failing action moves the snapshot into `error` status;
//! later events are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::machine::MachineDefinition;
use crate::engine::storage::SnapshotStore;
use crate::models::{ActorEvent, Snapshot, SnapshotStatus};
use crate::{LiveStateError, Result};

/// Where an actor writes its snapshot after every transition
#[derive(Clone)]
pub struct Persistence {
    pub store: Arc<dyn SnapshotStore>,
    pub key: String,
}

impl Persistence {
    pub fn new(store: Arc<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    async fn write(&self, snapshot: &Snapshot) {
        let serialized = match snapshot
            .to_persisted()
            .and_then(|value| Ok(serde_json::to_string(&value)?))
        {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!("Failed to serialize snapshot {}: {}", self.key, e);
                return;
            }
        };

        if let Err(e) = self.store.put(&self.key, serialized).await {
            warn!("Failed to persist snapshot {}: {}", self.key, e);
        }
    }
}

/// Cloneable handle to a running actor
#[derive(Clone)]
pub struct ActorRef {
    id: String,
    mailbox: mpsc::UnboundedSender<ActorEvent>,
    snapshots: watch::Receiver<Snapshot>,
}

impl std::fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef").field("id", &self.id).finish()
    }
}

impl ActorRef {
    /// A handle not attached to any running actor; every send fails
    pub fn detached(id: impl Into<String>) -> Self {
        let (mailbox, _) = mpsc::unbounded_channel();
        let (_, snapshots) = watch::channel(Snapshot::new(serde_json::Value::Null, serde_json::Value::Null));
        Self {
            id: id.into(),
            mailbox,
            snapshots,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue an event behind everything already in the mailbox
    pub fn send(&self, event: ActorEvent) -> Result<()> {
        self.mailbox
            .send(event)
            .map_err(|e| LiveStateError::Internal(format!("actor {} is stopped ({})", self.id, e.0.kind)))
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    /// Wait until the published snapshot satisfies `condition`
    pub async fn wait_for<F>(&self, condition: F, timeout: Duration) -> Result<Snapshot>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                {
                    let current = rx.borrow_and_update();
                    if condition(&current) {
                        return Ok(current.clone());
                    }
                    if current.status == SnapshotStatus::Error {
                        return Err(LiveStateError::Internal(format!(
                            "actor {} failed: {}",
                            self.id,
                            current.error.clone().unwrap_or_default()
                        )));
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(LiveStateError::Internal(format!(
                        "actor {} stopped before becoming ready",
                        self.id
                    )));
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            LiveStateError::Timeout(format!(
                "actor {} not ready after {:?}",
                self.id, timeout
            ))
        })?
    }
}

/// A running actor task
pub struct Actor {
    actor_ref: ActorRef,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Actor {
    /// Start the actor from `snapshot`.
    ///
    /// The snapshot is published immediately. It is persisted only after the
    /// first transition, so merely fetching a room does not write it.
    pub fn spawn(
        id: impl Into<String>,
        machine: Arc<MachineDefinition>,
        snapshot: Snapshot,
        persistence: Option<Persistence>,
    ) -> Self {
        let id = id.into();
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (publisher, snapshots) = watch::channel(snapshot);
        let cancel = CancellationToken::new();

        let actor_ref = ActorRef {
            id: id.clone(),
            mailbox,
            snapshots,
        };

        let handle = tokio::spawn(run(
            machine,
            actor_ref.clone(),
            inbox,
            publisher,
            persistence,
            cancel.clone(),
        ));

        info!("Actor {} started", id);
        Self {
            actor_ref,
            cancel,
            handle,
        }
    }

    pub fn actor_ref(&self) -> ActorRef {
        self.actor_ref.clone()
    }

    pub fn id(&self) -> &str {
        self.actor_ref.id()
    }

    pub fn send(&self, event: ActorEvent) -> Result<()> {
        self.actor_ref.send(event)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.actor_ref.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.actor_ref.subscribe()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Actor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    machine: Arc<MachineDefinition>,
    actor: ActorRef,
    mut inbox: mpsc::UnboundedReceiver<ActorEvent>,
    publisher: watch::Sender<Snapshot>,
    persistence: Option<Persistence>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = inbox.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let current = publisher.borrow().clone();
        if current.status == SnapshotStatus::Error {
            debug!("Actor {} is in error status; dropping {}", actor.id(), event.kind);
            continue;
        }

        let next = match machine.transition(&current, &event, &actor) {
            Ok(Some(next)) => next,
            Ok(None) => {
                debug!("Actor {} ignored event {}", actor.id(), event.kind);
                continue;
            }
            Err(LiveStateError::InvalidEvent(reason)) => {
                warn!("Actor {} rejected {}: {}", actor.id(), event.kind, reason);
                continue;
            }
            Err(e) => {
                error!("Actor {} failed handling {}: {}", actor.id(), event.kind, e);
                let mut failed = current;
                failed.status = SnapshotStatus::Error;
                failed.error = Some(e.to_string());
                failed
            }
        };

        debug!("Actor {} handled {}", actor.id(), event.kind);
        publisher.send_replace(next.clone());
        if let Some(persistence) = &persistence {
            persistence.write(&next).await;
        }
    }

    info!("Actor {} stopped", actor.id());
}
