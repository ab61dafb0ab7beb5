//! # meshsync-types
//!
//! Wire format types for the meshsync peer-to-peer state sync protocol.
//!
//! This crate provides the foundational types used across all meshsync crates:
//! - [`EndpointId`], [`MessageId`] - Identity types
//! - [`HybridTimestamp`] - Hybrid logical clock timestamps
//! - [`Frame`] - Fixed-width binary fragment framing
//! - [`WireMessage`] - Logical protocol messages (Change, Announce, Bye)
//! - [`ProtocolError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod frame;
mod ids;
mod messages;
mod timestamp;

pub use error::ProtocolError;
pub use frame::{Frame, FrameKind, FLAG_FINAL, FRAME_HEADER_SIZE, PROGRESS_COMPLETE};
pub use ids::{EndpointId, MessageId};
pub use messages::{Announce, Bye, Change, WireMessage};
pub use timestamp::HybridTimestamp;
