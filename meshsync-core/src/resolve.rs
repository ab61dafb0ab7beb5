//! Last-writer-wins conflict resolution.
//!
//! Given a key's current state and a candidate change, decide which wins
//! under the hybrid clock's total order. Values are opaque bytes replaced
//! wholesale - this is LWW over a causally-aware clock, not a CRDT merge.

use std::cmp::Ordering;

use meshsync_types::HybridTimestamp;

use crate::clock::HybridClock;

/// The current state of one replicated key.
///
/// Created on first write (local or remote); mutated only through
/// [`resolve`] + [`Node::apply`]. The timestamp is monotonically
/// increasing across the node's lifetime: no write is ever applied with
/// a timestamp that compares less than or equal to the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// The replicated key.
    pub key: String,
    /// Current value (opaque bytes).
    pub value: Vec<u8>,
    /// Timestamp of the write that produced the current value.
    pub timestamp: HybridTimestamp,
}

impl Node {
    /// Create a node from its first accepted write.
    pub fn new(key: String, change: IncomingChange) -> Self {
        Self {
            key,
            value: change.value,
            timestamp: change.timestamp,
        }
    }

    /// Overwrite this node with an accepted change.
    ///
    /// Callers must only pass changes that [`resolve`] accepted.
    pub fn apply(&mut self, change: IncomingChange) {
        self.value = change.value;
        self.timestamp = change.timestamp;
    }
}

/// A candidate update competing against a node's current state.
///
/// Ephemeral: produced per received or local write, consumed by one
/// [`resolve`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingChange {
    /// The proposed value.
    pub value: Vec<u8>,
    /// The writer's hybrid clock timestamp.
    pub timestamp: HybridTimestamp,
}

impl IncomingChange {
    /// Create a candidate change.
    pub fn new(value: Vec<u8>, timestamp: HybridTimestamp) -> Self {
        Self { value, timestamp }
    }
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The incoming change wins; the caller applies it.
    Accepted,
    /// The current state wins; nothing changes.
    Rejected,
}

impl Resolution {
    /// Whether the incoming change was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Resolution::Accepted)
    }
}

/// Decide whether an incoming change replaces the current state.
///
/// An absent node unconditionally accepts. Otherwise the incoming change
/// wins only if its timestamp compares strictly greater than the current
/// one. Exact ties are rejected (current wins): a correctly used clock
/// never produces ties for distinct writes, so a tie means replay or
/// clock misuse, and rejecting favors idempotence over accepting
/// duplicates.
pub fn resolve(current: Option<&Node>, incoming: &IncomingChange) -> Resolution {
    let current_ts = current.map(|node| &node.timestamp);
    match HybridClock::compare(current_ts, Some(&incoming.timestamp)) {
        Ordering::Less => Resolution::Accepted,
        Ordering::Equal | Ordering::Greater => Resolution::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(value: &[u8], physical: u64, logical: u64) -> IncomingChange {
        IncomingChange::new(value.to_vec(), HybridTimestamp::new(physical, logical))
    }

    #[test]
    fn absent_node_accepts_unconditionally() {
        let incoming = change(b"first", 0, 0);
        assert_eq!(resolve(None, &incoming), Resolution::Accepted);
    }

    #[test]
    fn newer_change_wins() {
        let node = Node::new("k".into(), change(b"old", 100, 1));
        let incoming = change(b"new", 100, 2);
        assert_eq!(resolve(Some(&node), &incoming), Resolution::Accepted);
    }

    #[test]
    fn older_change_is_rejected() {
        let node = Node::new("k".into(), change(b"current", 200, 5));
        let incoming = change(b"stale", 100, 50);
        assert_eq!(resolve(Some(&node), &incoming), Resolution::Rejected);
    }

    #[test]
    fn exact_tie_is_rejected() {
        let node = Node::new("k".into(), change(b"current", 100, 5));
        let incoming = change(b"replay", 100, 5);
        assert_eq!(resolve(Some(&node), &incoming), Resolution::Rejected);
    }

    #[test]
    fn second_application_is_a_no_op() {
        // LWW idempotence: applying the same change twice rejects the second.
        let incoming = change(b"v", 100, 3);

        assert!(resolve(None, &incoming).is_accepted());
        let node = Node::new("k".into(), incoming.clone());

        assert_eq!(resolve(Some(&node), &incoming), Resolution::Rejected);
        assert_eq!(node.value, b"v");
    }

    #[test]
    fn timestamps_never_regress_across_accepted_writes() {
        let mut node: Option<Node> = None;
        let candidates = [
            change(b"a", 100, 1),
            change(b"b", 90, 9), // stale, rejected
            change(b"c", 100, 2),
            change(b"d", 100, 2), // duplicate, rejected
            change(b"e", 150, 1),
            change(b"f", 120, 99), // stale, rejected
        ];

        let mut applied = Vec::new();
        for incoming in candidates {
            if resolve(node.as_ref(), &incoming).is_accepted() {
                match node.as_mut() {
                    Some(n) => n.apply(incoming.clone()),
                    None => node = Some(Node::new("k".into(), incoming.clone())),
                }
                applied.push(incoming.timestamp);
            }
        }

        assert_eq!(node.as_ref().unwrap().value, b"e");
        for pair in applied.windows(2) {
            assert!(pair[0] < pair[1], "accepted timestamps must increase");
        }
    }

    #[test]
    fn values_are_replaced_wholesale() {
        let mut node = Node::new("k".into(), change(b"long original value", 1, 1));
        node.apply(change(b"x", 1, 2));
        assert_eq!(node.value, b"x");
    }
}
