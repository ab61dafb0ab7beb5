//! Logical protocol messages for meshsync.
//!
//! These are the payloads carried inside reassembled frame sequences.
//! Messages are MessagePack-encoded and validated at the boundary:
//! a payload that does not decode into a tagged [`WireMessage`] variant
//! is rejected before it reaches conflict resolution.

use serde::{Deserialize, Serialize};

use crate::{EndpointId, HybridTimestamp, ProtocolError};

/// All possible logical messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// A replicated key changed.
    Change(Change),
    /// Presence re-announcement (sent on the refresh timer).
    Announce(Announce),
    /// Graceful disconnect.
    Bye(Bye),
}

impl WireMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(ProtocolError::Deserialization)
    }
}

/// A write to one replicated key, tagged with its hybrid clock timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// The replicated key.
    pub key: String,
    /// The new value. Opaque bytes, replaced wholesale (LWW, not merged).
    pub value: Vec<u8>,
    /// Timestamp assigned by the writer's hybrid clock.
    pub timestamp: HybridTimestamp,
}

/// Presence re-announcement used to validate link health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    /// The announcing endpoint.
    pub endpoint: EndpointId,
}

/// Graceful disconnect message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bye {
    /// Optional reason for disconnect.
    pub reason: Option<String>,
}
