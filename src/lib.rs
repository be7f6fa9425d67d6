// LiveState - Rust Edition
// Server-authoritative actors kept live-synchronized with many viewers

//! # LiveState Library
//!
//! LiveState keeps any number of connected clients consistent with one durable,
//! server-owned state machine per room. Clients fetch a snapshot over HTTP, open a
//! socket with a short-lived connection token and from then on receive JSON-patch
//! diffs computed against their own last-seen baseline.
//!
//! Part of an actor's context can be filled in by a language model: the
//! [`TokenStreamSource`] turns a completion call into a chunk stream (optionally
//! replicated into a replay cache so late consumers can attach), and the
//! [`StreamingDecoder`] turns the accumulating text into validated partial and
//! final values that are delivered back into the actor as ordinary events.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Caller`]: authenticated identity behind every request and connection
//! - [`Snapshot`]: serializable state value + context of an actor
//! - [`ActorEvent`]: the `type`-tagged event routed into a machine
//! - [`StateNode`]: the declared hierarchical/parallel state tree
//!
//! ### Engine
//! - [`MachineDefinition`]: state tree plus a per-event handler table
//! - [`Actor`]: the single task that applies events to a snapshot, one at a time
//! - [`ActorHost`]: one running actor per room, with auth, diffing and persistence
//! - [`ActorHub`]: registry of actor types and their rooms
//!
//! ### LLM Streaming
//! - [`TokenStreamSource`]: completion call as a chunk stream, with replay cache
//! - [`StreamingDecoder`]: sanitize + YAML decode + schema validation per chunk
//!
//! ### API
//! - [`TokenService`]: access and connection tokens
//! - [`ActorClient`]: caller-side HTTP/socket wrapper

// Core domain models
pub mod models;

// Actor runtime, storage and migrations
pub mod engine;

// LLM providers, token streams and the structured-output decoder
pub mod llm;

// HTTP/socket surface, tokens and the actor client
pub mod api;

// Server wiring and configuration
pub mod server;

// Concrete actor types served by the bundled server
pub mod machines;

// Re-export core domain types for easy access
pub use models::{
    ActorEvent,     // Type-tagged event delivered to a machine
    Caller,         // Authenticated identity
    CallerType,     // guest | user | system
    Snapshot,       // State value + context
    SnapshotStatus, // active | done | error
    StateNode,      // Declared state tree
};

pub use engine::{
    actor::{Actor, ActorRef},
    diff::{apply_patch, diff_snapshots, DiffMessage, SnapshotMirror},
    host::{ActorHost, CallerCredentials, FetchedSnapshot, HostConfig, LiveConnection},
    hub::ActorHub,
    machine::{MachineDefinition, Transition},
    migration::{apply_migrations, generate_migrations},
    nats_storage::{NatsKvStore, NatsStoreConfig},
    schema::Schema,
    storage::{
        snapshot_key, ChunkStore, InMemoryChunkStore, InMemorySnapshotStore, RunStatus, SnapshotStore,
    },
};

pub use llm::{
    decoder::{DecoderEvent, StreamingDecoder},
    sanitize::sanitize,
    stream_source::{
        attach, get_completed_stream, get_running_stream, StreamPrompt, StreamSourceConfig,
        TextStream, TokenStreamSource,
    },
    LLMError, LLMProviderClient, LLMResult,
};

pub use api::{
    client::{ActorClient, ActorSocket},
    tokens::TokenService,
};

pub use machines::{session_machine, SessionServices, SESSION_ACTOR_TYPE};

pub use server::{LiveStateServer, PersistenceMode, ServerBuilder, ServerConfig};

// Core error types
use thiserror::Error;

/// Errors produced by the actor runtime and its HTTP/socket surface.
#[derive(Error, Debug)]
pub enum LiveStateError {
    /// Missing, invalid or mismatched token, or no caller could be resolved
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Event body failed the declared event schema or used a reserved type
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A persisted snapshot could not be migrated onto the current machine
    #[error("Migration failed at {path}: {reason}")]
    Migration { path: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A bounded wait (e.g. for the ready condition) elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Storage-related errors (NATS and in-memory backends)
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("LLM error: {0}")]
    Llm(#[from] LLMError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for LiveStateError {
    fn from(err: std::io::Error) -> Self {
        LiveStateError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, LiveStateError>;
