//! Hybrid logical clock.
//!
//! The clock combines wall-clock milliseconds with a logical counter so
//! that timestamps are both roughly real-time ordered and strictly
//! causally monotonic. Transport order across links is not trusted;
//! causal order is recovered from these timestamps instead.
//!
//! The clock is owned explicitly and passed by handle to whatever needs
//! causal ordering - never ambient global state. This keeps the core
//! testable and allows many simulated nodes in one test process.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use meshsync_types::HybridTimestamp;

/// A hybrid logical clock.
///
/// Tracks the last-observed wall time and a logical counter, both
/// monotonically adjusted. One instance per node.
#[derive(Debug, Clone, Default)]
pub struct HybridClock {
    /// Last-observed wall time in milliseconds.
    physical: u64,
    /// Logical counter.
    logical: u64,
}

impl HybridClock {
    /// Create a clock with no observed time yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce a fresh timestamp using the system wall clock.
    ///
    /// Every call yields a strictly increasing timestamp, even under
    /// identical (or regressing) wall-clock readings.
    pub fn now(&mut self) -> HybridTimestamp {
        self.tick(wall_clock_ms())
    }

    /// Produce a fresh timestamp for the given wall-clock reading.
    ///
    /// This is the deterministic core of [`now`](Self::now); tests drive
    /// it directly with a frozen clock.
    pub fn tick(&mut self, wall_ms: u64) -> HybridTimestamp {
        self.physical = self.physical.max(wall_ms);
        self.logical = self.logical.saturating_add(1);
        HybridTimestamp::new(self.physical, self.logical)
    }

    /// Merge causal knowledge from a timestamp observed on a peer.
    ///
    /// After this call the local clock can never produce a timestamp that
    /// compares less than or equal to `remote` - the standard hybrid
    /// logical clock receive rule.
    pub fn update(&mut self, remote: &HybridTimestamp) {
        self.physical = self.physical.max(remote.physical);
        self.logical = self.logical.max(remote.logical).saturating_add(1);
    }

    /// Total order over optional timestamps, physical-major.
    ///
    /// Absent sorts before present; absent vs absent is equal. Otherwise
    /// physical time is compared first, with the logical counter breaking
    /// ties.
    pub fn compare(a: Option<&HybridTimestamp>, b: Option<&HybridTimestamp>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }

    /// The last wall time this clock has observed, in milliseconds.
    pub fn physical(&self) -> u64 {
        self.physical
    }

    /// The current logical counter value.
    pub fn logical(&self) -> u64 {
        self.logical
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
