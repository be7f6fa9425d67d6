// Actor hosts
// One running actor per room, with caller resolution, per-connection diffs and persistence

//! # Actor Host
//!
//! An [`ActorHost`] owns exactly one running [`Actor`] for one room id and is
//! the only way callers interact with it:
//!
//! ```text
//! GET    fetch_snapshot  ── access token ──► caller ──► ensure running ──► wait ready
//!                                                                  │
//!                        ◄── {connectionId, token, snapshot} ◄─────┘  (record caller + baseline)
//!
//! socket on_connect      ── connection token ──► recorded caller ──► listener task
//!                                                                  │
//!                        ◄── {operations: [...]} per state change ─┘  (diff vs own baseline)
//!
//! POST   submit_event    ── access or connection token ──► caller ──► validate ──► actor
//! ```
//!
//! ## Connection Bookkeeping
//!
//! Each connection id has one record: the caller it was issued to, the last
//! snapshot sent over it (its baseline) and whether a socket has attached.
//! Diffs are always computed against the connection's own baseline, and the
//! baseline is replaced in the same critical section as the diff is queued,
//! so concurrent state changes can never interleave two diffs for one
//! connection out of order.
//!
//! ## Failure Semantics
//!
//! - No resolvable caller on `fetch_snapshot`/`submit_event`: `Unauthorized`
//! - No resolvable caller on `on_connect`: logged and refused, nothing sent
//! - Migration failure on startup: `Migration`, returned to every caller until
//!   the definition is fixed
//! - Persistence write failure: logged by the actor, which keeps serving

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::tokens::TokenService;
use crate::engine::actor::{Actor, ActorRef, Persistence};
use crate::engine::diff::{diff_snapshots, DiffMessage};
use crate::engine::machine::MachineDefinition;
use crate::engine::migration::{apply_migrations, generate_migrations};
use crate::engine::storage::{snapshot_key, SnapshotStore};
use crate::models::{
    ActorEvent, Caller, Snapshot, CONNECT_EVENT, DISCONNECT_EVENT, RESUME_EVENT,
};
use crate::{LiveStateError, Result};

/// Identity of the host itself when it sends transport events
const HOST_CALLER_ID: &str = "host";

/// Runtime knobs shared by every host of a hub
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Upper bound on how long `fetch_snapshot` waits for the ready condition
    pub ready_timeout: Duration,
    /// Fetched connection ids that never attach are forgotten after this long
    pub unattached_ttl: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            unattached_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Credentials presented with a request or socket upgrade
#[derive(Debug, Clone, Default)]
pub struct CallerCredentials {
    /// Access token from `Authorization: Bearer ...`
    pub access_token: Option<String>,
    /// Connection token from the `token` query parameter or request field
    pub connection_token: Option<String>,
}

impl CallerCredentials {
    pub fn access(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            connection_token: None,
        }
    }

    pub fn connection(token: impl Into<String>) -> Self {
        Self {
            access_token: None,
            connection_token: Some(token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.connection_token.is_none()
    }
}

/// Response of a snapshot fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedSnapshot {
    pub connection_id: String,
    pub token: String,
    pub snapshot: Value,
}

/// A socket accepted by [`ActorHost::on_connect`]
#[derive(Debug)]
pub struct LiveConnection {
    pub connection_id: String,
    pub caller: Caller,
    /// Diff messages to send, in order
    pub updates: mpsc::UnboundedReceiver<DiffMessage>,
}

struct ConnectionRecord {
    caller: Caller,
    baseline: Value,
    attached: bool,
    issued_at: Instant,
    listener: Option<AbortHandle>,
}

/// Host for a single room of one actor type
pub struct ActorHost {
    actor_type: String,
    room_id: String,
    machine: Arc<MachineDefinition>,
    store: Option<Arc<dyn SnapshotStore>>,
    tokens: TokenService,
    config: HostConfig,
    started: OnceCell<()>,
    actor: Mutex<Option<Actor>>,
    connections: Arc<DashMap<String, ConnectionRecord>>,
}

impl ActorHost {
    pub fn new(
        room_id: impl Into<String>,
        machine: Arc<MachineDefinition>,
        store: Option<Arc<dyn SnapshotStore>>,
        tokens: TokenService,
        config: HostConfig,
    ) -> Self {
        Self {
            actor_type: machine.actor_type().to_string(),
            room_id: room_id.into(),
            machine,
            store,
            tokens,
            config,
            started: OnceCell::new(),
            actor: Mutex::new(None),
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn actor_type(&self) -> &str {
        &self.actor_type
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn storage_key(&self) -> String {
        snapshot_key(&self.actor_type, &self.room_id)
    }

    /// Restore the persisted snapshot, if any. Runs at most once successfully.
    pub async fn on_start(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| self.restore())
            .await
            .map(|_| ())
    }

    async fn restore(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let key = self.storage_key();
        let Some(raw) = store.get(&key).await? else {
            debug!("No persisted snapshot for {}", key);
            return Ok(());
        };

        let persisted: Value = serde_json::from_str(&raw)?;
        let migrations = generate_migrations(&self.machine, &persisted)?;
        let migrated = apply_migrations(&persisted, &migrations)?;
        let snapshot = Snapshot::from_persisted(migrated)?;

        let actor = self.spawn_actor(snapshot);
        actor.send(ActorEvent::new(RESUME_EVENT).with_caller(Caller::system(HOST_CALLER_ID)))?;
        *self.actor.lock().await = Some(actor);

        info!(
            "Restored {} with {} migration operation(s)",
            key,
            migrations.0.len()
        );
        Ok(())
    }

    fn spawn_actor(&self, snapshot: Snapshot) -> Actor {
        let persistence = self
            .store
            .as_ref()
            .map(|store| Persistence::new(store.clone(), self.storage_key()));
        Actor::spawn(self.storage_key(), self.machine.clone(), snapshot, persistence)
    }

    /// Make sure the actor runs, constructing it from `input` on first access
    pub async fn ensure_running(&self, input: &Value) -> Result<ActorRef> {
        self.on_start().await?;

        let mut slot = self.actor.lock().await;
        if let Some(actor) = slot.as_ref() {
            if !actor.is_finished() {
                return Ok(actor.actor_ref());
            }
        }

        let actor = self.spawn_actor(self.machine.initial_snapshot(input));
        let actor_ref = actor.actor_ref();
        *slot = Some(actor);
        Ok(actor_ref)
    }

    /// Current snapshot of the running actor, if any
    pub async fn snapshot(&self) -> Option<Snapshot> {
        self.actor.lock().await.as_ref().map(Actor::snapshot)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub async fn fetch_snapshot(
        &self,
        credentials: &CallerCredentials,
        input: &Value,
    ) -> Result<FetchedSnapshot> {
        let token = credentials
            .access_token
            .as_deref()
            .ok_or_else(|| LiveStateError::Unauthorized("missing access token".to_string()))?;
        let caller = self
            .tokens
            .verify_access_token(token, &self.actor_type, &self.room_id)?;

        let actor = self.ensure_running(input).await?;
        let machine = self.machine.clone();
        let snapshot = actor
            .wait_for(move |s| machine.is_ready(s), self.config.ready_timeout)
            .await?;
        let persisted = snapshot.to_persisted()?;

        self.forget_stale_connections();
        let connection_id = Uuid::new_v4().to_string();
        let token = self
            .tokens
            .create_connection_token(&self.room_id, &connection_id)?;
        self.connections.insert(
            connection_id.clone(),
            ConnectionRecord {
                caller: caller.clone(),
                baseline: persisted.clone(),
                attached: false,
                issued_at: Instant::now(),
                listener: None,
            },
        );

        debug!(
            "Issued connection {} on {} to {}",
            connection_id,
            self.storage_key(),
            caller.subject()
        );
        Ok(FetchedSnapshot {
            connection_id,
            token,
            snapshot: persisted,
        })
    }

    /// Resolve the caller from a bearer access token, or from the record of the
    /// connection a connection token is bound to
    fn resolve_caller(&self, credentials: &CallerCredentials) -> Result<(Caller, Option<String>)> {
        if let Some(token) = credentials.access_token.as_deref() {
            let caller = self
                .tokens
                .verify_access_token(token, &self.actor_type, &self.room_id)?;
            return Ok((caller, None));
        }

        if let Some(token) = credentials.connection_token.as_deref() {
            let connection_id = self.tokens.verify_connection_token(token)?;
            let caller = self
                .connections
                .get(&connection_id)
                .map(|record| record.caller.clone())
                .ok_or_else(|| {
                    LiveStateError::Unauthorized(format!(
                        "no caller recorded for connection {}",
                        connection_id
                    ))
                })?;
            return Ok((caller, Some(connection_id)));
        }

        Err(LiveStateError::Unauthorized(
            "no access or connection token".to_string(),
        ))
    }

    pub async fn submit_event(&self, credentials: &CallerCredentials, body: Value) -> Result<()> {
        let (caller, connection_id) = self.resolve_caller(credentials)?;
        let event = self.parse_event(body, caller, connection_id)?;
        let actor = self.ensure_running(&Value::Null).await?;
        debug!("Forwarding {} to {}", event.kind, self.storage_key());
        actor.send(event)
    }

    fn parse_event(
        &self,
        body: Value,
        caller: Caller,
        connection_id: Option<String>,
    ) -> Result<ActorEvent> {
        if let Some(schema) = self.machine.event_schema() {
            schema.validate_event(&body)?;
        }
        ActorEvent::from_body(body, caller, connection_id)
    }

    /// Attach a socket. Returns `None`, after logging, when the caller cannot be
    /// resolved or the connection id was already consumed.
    pub async fn on_connect(&self, credentials: &CallerCredentials) -> Option<LiveConnection> {
        let (caller, connection_id) = match self.claim_connection(credentials) {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!("Refusing socket on {}: {}", self.storage_key(), e);
                return None;
            }
        };

        let actor = match self.ensure_running(&Value::Null).await {
            Ok(actor) => actor,
            Err(e) => {
                warn!("Refusing socket on {}: {}", self.storage_key(), e);
                self.connections.remove(&connection_id);
                return None;
            }
        };

        let (sender, updates) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listen(
            actor.clone(),
            self.connections.clone(),
            connection_id.clone(),
            sender,
        ));
        match self.connections.get_mut(&connection_id) {
            Some(mut record) => record.listener = Some(listener.abort_handle()),
            None => listener.abort(),
        }

        let connect = ActorEvent::new(CONNECT_EVENT)
            .with_caller(caller.clone())
            .with_connection(connection_id.clone());
        if let Err(e) = actor.send(connect) {
            warn!("Failed to deliver connect event: {}", e);
        }

        info!(
            "Socket {} attached to {} as {}",
            connection_id,
            self.storage_key(),
            caller.subject()
        );
        Some(LiveConnection {
            connection_id,
            caller,
            updates,
        })
    }

    fn claim_connection(&self, credentials: &CallerCredentials) -> Result<(Caller, String)> {
        if let Some(token) = credentials.access_token.as_deref() {
            let caller = self
                .tokens
                .verify_access_token(token, &self.actor_type, &self.room_id)?;
            let connection_id = Uuid::new_v4().to_string();
            self.connections.insert(
                connection_id.clone(),
                ConnectionRecord {
                    caller: caller.clone(),
                    baseline: Value::Null,
                    attached: true,
                    issued_at: Instant::now(),
                    listener: None,
                },
            );
            return Ok((caller, connection_id));
        }

        let token = credentials
            .connection_token
            .as_deref()
            .ok_or_else(|| LiveStateError::Unauthorized("no connection token".to_string()))?;
        let connection_id = self.tokens.verify_connection_token(token)?;

        let mut record = self.connections.get_mut(&connection_id).ok_or_else(|| {
            LiveStateError::Unauthorized(format!("unknown connection {}", connection_id))
        })?;
        if record.attached {
            return Err(LiveStateError::Unauthorized(format!(
                "connection {} was already used",
                connection_id
            )));
        }
        record.attached = true;
        Ok((record.caller.clone(), connection_id.clone()))
    }

    /// Forward an event received over a socket
    pub async fn on_message(&self, connection_id: &str, text: &str) -> Result<()> {
        let caller = self
            .connections
            .get(connection_id)
            .filter(|record| record.attached)
            .map(|record| record.caller.clone())
            .ok_or_else(|| {
                LiveStateError::Unauthorized(format!("connection {} is not attached", connection_id))
            })?;

        let body: Value = serde_json::from_str(text)
            .map_err(|e| LiveStateError::InvalidEvent(format!("malformed event: {}", e)))?;
        let event = self.parse_event(body, caller, Some(connection_id.to_string()))?;
        let actor = self.ensure_running(&Value::Null).await?;
        actor.send(event)
    }

    /// Detach a socket and stop its diff listener
    pub async fn on_close(&self, connection_id: &str) {
        let Some((_, record)) = self.connections.remove(connection_id) else {
            return;
        };
        if let Some(listener) = record.listener {
            listener.abort();
        }

        if let Some(actor) = self.actor.lock().await.as_ref() {
            let disconnect = ActorEvent::new(DISCONNECT_EVENT)
                .with_caller(record.caller.clone())
                .with_connection(connection_id);
            if let Err(e) = actor.send(disconnect) {
                debug!("Failed to deliver disconnect event: {}", e);
            }
        }
        info!("Socket {} detached from {}", connection_id, self.storage_key());
    }

    fn forget_stale_connections(&self) {
        let ttl = self.config.unattached_ttl;
        self.connections
            .retain(|_, record| record.attached || record.issued_at.elapsed() < ttl);
    }

    /// Stop the actor and every listener
    pub async fn shutdown(&self) {
        for entry in self.connections.iter() {
            if let Some(listener) = &entry.listener {
                listener.abort();
            }
        }
        self.connections.clear();
        if let Some(actor) = self.actor.lock().await.take() {
            actor.stop();
        }
    }
}

/// Per-connection listener: sends the diff against the connection's baseline
/// now and after every published snapshot
async fn listen(
    actor: ActorRef,
    connections: Arc<DashMap<String, ConnectionRecord>>,
    connection_id: String,
    sender: mpsc::UnboundedSender<DiffMessage>,
) {
    let mut snapshots = actor.subscribe();
    loop {
        let current = snapshots.borrow_and_update().clone();
        match push_diff(&connections, &connection_id, &current, &sender) {
            Ok(()) => {}
            Err(reason) => {
                debug!("Listener for {} stopped: {}", connection_id, reason);
                return;
            }
        }
        if snapshots.changed().await.is_err() {
            return;
        }
    }
}

fn push_diff(
    connections: &DashMap<String, ConnectionRecord>,
    connection_id: &str,
    current: &Snapshot,
    sender: &mpsc::UnboundedSender<DiffMessage>,
) -> std::result::Result<(), String> {
    let current = current.to_persisted().map_err(|e| e.to_string())?;
    let mut record = connections
        .get_mut(connection_id)
        .ok_or_else(|| "connection closed".to_string())?;

    let message = diff_snapshots(&record.baseline, &current);
    if message.is_empty() {
        return Ok(());
    }
    sender
        .send(message)
        .map_err(|_| "socket dropped".to_string())?;
    record.baseline = current;
    Ok(())
}

impl Drop for ActorHost {
    fn drop(&mut self) {
        for entry in self.connections.iter() {
            if let Some(listener) = &entry.listener {
                listener.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod host_tests;
