// LiveState Engine
// The actor runtime: machines, running actors, hosts, storage and migrations

//! # Engine Module
//!
//! The engine sits between the domain models and the HTTP/socket surface:
//!
//! - **Domain Models**: plain data (in `models/`)
//! - **Engine Layer**: running actors and everything they persist (this module)
//! - **API Layer**: routes, sockets, tokens and the client (in `api/`)
//!
//! ## Engine Components
//!
//! ### Machines (`machine`)
//! - State tree plus handler table, keyed by event `type`
//! - Ready condition, event schema and migration hints
//!
//! ### Actors (`actor`)
//! - One task per actor, serial event processing
//! - Snapshots published on a watch channel and persisted best-effort
//!
//! ### Hosts and Hub (`host`, `hub`)
//! - One host per room: caller resolution, connection bookkeeping, diffs
//! - The hub maps actor types and room ids to hosts
//!
//! ### Storage (`storage`, `nats_storage`)
//! - Snapshot store and replay-cache chunk store
//! - In-memory and NATS JetStream key-value backends
//!
//! ### Diffing, Migration and Schemas (`diff`, `migration`, `schema`)

pub mod actor;
pub mod diff;
pub mod host;
pub mod hub;
pub mod machine;
pub mod migration;
pub mod nats_storage;
pub mod schema;
pub mod storage;

pub use actor::{Actor, ActorRef, Persistence};
pub use diff::{apply_patch, diff_snapshots, DiffMessage, SnapshotMirror};
pub use host::{ActorHost, CallerCredentials, FetchedSnapshot, HostConfig, LiveConnection};
pub use hub::ActorHub;
pub use machine::{ActionScope, MachineDefinition, Transition};
pub use migration::{apply_migrations, generate_migrations};
pub use nats_storage::{NatsKvStore, NatsStoreConfig};
pub use schema::Schema;
pub use storage::{
    snapshot_key, ChunkStore, InMemoryChunkStore, InMemorySnapshotStore, RunStatus, SnapshotStore,
};
