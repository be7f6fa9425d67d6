// Storage abstraction for actor snapshots and token-stream replay runs
// This defines the interfaces the host and the stream source persist through

//! # Storage Abstraction Layer
//!
//! Two durable stores back the runtime:
//!
//! - **SnapshotStore**: one string entry per room, holding the JSON-serialized
//!   persisted snapshot. Exactly one writer per room (its host), read once at
//!   startup.
//! - **ChunkStore**: the replay cache for token-stream runs. One ordered list of
//!   text chunks plus one status scalar per cache key. Exactly one writer per
//!   run (the task that owns the original completion call), any number of
//!   readers.
//!
//! Both traits are async and `Send + Sync` so a single backend can be shared by
//! every room in the process. The in-memory implementations here are used for
//! development and tests; `nats_storage` provides the JetStream-backed ones.
//!
//! ## Run Status
//!
//! A run only ever moves forward:
//!
//! ```text
//! uninitialized ──► running ──► done
//! ```
//!
//! Backends reject a backwards transition and reject appends once a run is
//! `done`, so the chunk list of a finished run is immutable.

use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Status of a token-stream replay run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Uninitialized,
    Running,
    Done,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Uninitialized => "uninitialized",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic
    pub fn can_advance_to(&self, next: RunStatus) -> bool {
        next >= *self
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "uninitialized" | "" => Ok(RunStatus::Uninitialized),
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            other => Err(anyhow::anyhow!("unknown run status: {}", other)),
        }
    }
}

/// Storage for persisted actor snapshots, one string entry per room key
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Get the persisted snapshot stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the persisted snapshot stored under `key`
    async fn put(&self, key: &str, snapshot: String) -> Result<()>;
}

/// Storage for token-stream replay runs.
///
/// ## Return Value
/// `read_from` returns the chunks at positions `from..` in append order. A key
/// that was never written reads as an empty list with status `Uninitialized`.
#[async_trait::async_trait]
pub trait ChunkStore: Send + Sync {
    /// Append a batch of chunks to the run's ordered list
    ///
    /// ## Errors
    /// - The run is already `done`
    /// - Storage backend is unavailable
    async fn append(&self, key: &str, chunks: Vec<String>) -> Result<()>;

    /// Read every chunk at index `from` and after
    async fn read_from(&self, key: &str, from: usize) -> Result<Vec<String>>;

    async fn status(&self, key: &str) -> Result<RunStatus>;

    /// Claim a run for writing: move it from `uninitialized` to `running` in
    /// one step. Returns `false` when the run was already started, so at most
    /// one caller ever becomes the writer of a key.
    async fn start_run(&self, key: &str) -> Result<bool>;

    /// Move the run to `status`.
    ///
    /// ## Errors
    /// - The transition would move the status backwards (e.g. `done → running`)
    async fn set_status(&self, key: &str, status: RunStatus) -> Result<()>;
}

/// Build the fixed per-room snapshot key
pub fn snapshot_key(actor_type: &str, room_id: &str) -> String {
    format!("{}:{}", actor_type, room_id)
}

/// In-memory snapshot storage for development and testing
#[derive(Default)]
pub struct InMemorySnapshotStore {
    entries: DashMap<String, String>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &str, snapshot: String) -> Result<()> {
        self.entries.insert(key.to_string(), snapshot);
        Ok(())
    }
}

#[derive(Default)]
struct Run {
    status: RunStatus,
    chunks: Vec<String>,
}

/// In-memory replay cache for development and testing
#[derive(Default)]
pub struct InMemoryChunkStore {
    runs: DashMap<String, Run>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn append(&self, key: &str, chunks: Vec<String>) -> Result<()> {
        let mut run = self.runs.entry(key.to_string()).or_default();
        if run.status == RunStatus::Done {
            return Err(anyhow::anyhow!("run {} is done; chunk list is immutable", key).into());
        }
        run.chunks.extend(chunks);
        Ok(())
    }

    async fn read_from(&self, key: &str, from: usize) -> Result<Vec<String>> {
        Ok(self
            .runs
            .get(key)
            .map(|run| run.chunks.iter().skip(from).cloned().collect())
            .unwrap_or_default())
    }

    async fn status(&self, key: &str) -> Result<RunStatus> {
        Ok(self.runs.get(key).map(|run| run.status).unwrap_or_default())
    }

    async fn start_run(&self, key: &str) -> Result<bool> {
        let mut run = self.runs.entry(key.to_string()).or_default();
        if run.status != RunStatus::Uninitialized {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        Ok(true)
    }

    async fn set_status(&self, key: &str, status: RunStatus) -> Result<()> {
        let mut run = self.runs.entry(key.to_string()).or_default();
        if !run.status.can_advance_to(status) {
            return Err(anyhow::anyhow!(
                "run {} cannot move from {} to {}",
                key,
                run.status,
                status
            )
            .into());
        }
        run.status = status;
        Ok(())
    }
}
