//! # meshsync-core
//!
//! Pure logic for meshsync (no I/O, instant tests).
//!
//! This crate implements the clocks, conflict resolution, fragmentation
//! and link-lifecycle state machines for peer-to-peer state sync without
//! any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, timers) is performed by `meshsync-engine`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod clock;
pub mod link;
pub mod pool;
pub mod resolve;

pub use chunk::{split_message, ChunkError, Reassembler, DEFAULT_MAX_FRAGMENTS};
pub use clock::HybridClock;
pub use link::{BackoffPolicy, LinkAction, LinkEvent, LinkNotice, LinkState};
pub use pool::EndpointPool;
pub use resolve::{resolve, IncomingChange, Node, Resolution};
