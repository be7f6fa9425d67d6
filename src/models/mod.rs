// Core domain models for LiveState
// These are the serializable data structures shared by the engine and the API

//! # Domain Models Module
//!
//! This module contains the data structures that cross process boundaries:
//! the identity of a caller, the snapshot of an actor, the events routed into
//! a machine, and the declared shape of a machine's states.
//!
//! None of these types carry behavior beyond parsing and small helpers; the
//! runtime that drives them lives in `engine`.

// Caller identity derived from verified tokens
pub mod caller;

// Actor snapshot (state value + context + status)
pub mod snapshot;

// Type-tagged events and reserved transport events
pub mod event;

// Declared hierarchical/parallel state tree
pub mod state;

pub use caller::{Caller, CallerType};
pub use event::{ActorEvent, CONNECT_EVENT, DISCONNECT_EVENT, RESERVED_EVENT_TYPES, RESUME_EVENT};
pub use snapshot::{Snapshot, SnapshotStatus};
pub use state::{state_matches, StateNode};
