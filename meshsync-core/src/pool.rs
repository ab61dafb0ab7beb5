//! Deterministic endpoint selection.
//!
//! The connection manager keeps a fixed number of live links drawn from a
//! larger configured pool of relay/bootstrap addresses. Selection must be
//! deterministic given the same inputs so tests can predict it, yet vary
//! across rotations so a node does not pin the same relays forever.
//!
//! Candidates are ranked by the SHA-256 digest of `(epoch, address)`;
//! the lowest digests win. Bumping the epoch produces a fresh but equally
//! deterministic ranking. Hashing is delegated to the `sha2` crate.

use sha2::{Digest, Sha256};

/// A rotating pool of candidate endpoint addresses.
#[derive(Debug, Clone)]
pub struct EndpointPool {
    candidates: Vec<String>,
    active_count: usize,
    epoch: u64,
}

impl EndpointPool {
    /// Create a pool over the given candidates, keeping `active_count`
    /// of them selected at a time.
    pub fn new(candidates: Vec<String>, active_count: usize) -> Self {
        Self {
            candidates,
            active_count,
            epoch: 0,
        }
    }

    /// The currently selected subset, in rank order.
    ///
    /// Deterministic for a given candidate list and epoch.
    pub fn selection(&self) -> Vec<String> {
        let mut ranked: Vec<&String> = self.candidates.iter().collect();
        ranked.sort_by_key(|addr| self.rank(addr));
        ranked
            .into_iter()
            .take(self.active_count)
            .cloned()
            .collect()
    }

    /// The best-ranked candidate not currently in `active`.
    ///
    /// Used to replace a permanently failed endpoint without re-ranking
    /// the healthy ones.
    pub fn replacement(&self, active: &[String]) -> Option<String> {
        let mut ranked: Vec<&String> = self
            .candidates
            .iter()
            .filter(|addr| !active.contains(addr))
            .collect();
        ranked.sort_by_key(|addr| self.rank(addr));
        ranked.first().map(|addr| (*addr).clone())
    }

    /// Advance to the next rotation epoch, changing the ranking.
    pub fn rotate(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Current rotation epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Total number of configured candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether the pool has no candidates at all.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn rank(&self, address: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.epoch.to_le_bytes());
        hasher.update(address.as_bytes());
        hasher.finalize().into()
    }
}
