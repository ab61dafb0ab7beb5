//! Hybrid logical clock timestamps.
//!
//! A [`HybridTimestamp`] combines wall-clock milliseconds with a logical
//! counter. The derived ordering is physical-major: physical time is
//! compared first, with the logical counter breaking ties. This gives
//! rough real-time ordering plus strict causal monotonicity when the
//! timestamps come from a `HybridClock` (meshsync-core).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A causally-meaningful timestamp produced by a hybrid logical clock.
///
/// Immutable once created. Field order matters: the derived `Ord` compares
/// `physical` first and breaks ties on `logical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct HybridTimestamp {
    /// Wall-clock milliseconds since the Unix epoch.
    pub physical: u64,
    /// Logical counter for events within the same physical millisecond.
    pub logical: u64,
}

impl HybridTimestamp {
    /// Create a timestamp from its components.
    pub fn new(physical: u64, logical: u64) -> Self {
        Self { physical, logical }
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}
