//! The sync engine: replicated key-value state over managed links.
//!
//! Ties the pieces together. Local writes are timestamped by the hybrid
//! clock and broadcast; remote changes first advance the clock, then go
//! through last-writer-wins resolution, and only accepted changes are
//! relayed onward. Rejected duplicates are dropped silently, which is
//! what makes relaying safe: every change dies at the first node that
//! has already seen something newer.

use std::sync::{Arc, Mutex as StdMutex};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use meshsync_core::{resolve, HybridClock, IncomingChange, Node};
use meshsync_types::{Bye, Change, EndpointId, HybridTimestamp, WireMessage};

use crate::config::{ConfigError, EngineConfig};
use crate::manager::{ConnectionManager, PeerEvent};
use crate::transport::Connector;

/// Errors from engine startup.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Shared handle to the node's hybrid clock.
///
/// The clock is tiny and every operation on it is a few integer
/// comparisons, so a plain mutex is the right tool. Passed explicitly to
/// everything that stamps or observes time.
#[derive(Clone)]
pub struct ClockHandle(Arc<StdMutex<HybridClock>>);

impl ClockHandle {
    /// A fresh clock at the current wall time.
    pub fn new() -> Self {
        Self(Arc::new(StdMutex::new(HybridClock::new())))
    }

    /// Stamp a local event.
    pub fn now(&self) -> HybridTimestamp {
        self.0.lock().expect("clock mutex poisoned").now()
    }

    /// Absorb a remote timestamp so later local stamps order after it.
    pub fn update(&self, remote: &HybridTimestamp) {
        self.0.lock().expect("clock mutex poisoned").update(remote);
    }
}

impl Default for ClockHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Whether the write replaced the key's state.
    pub accepted: bool,
    /// The timestamp the write was stamped with.
    pub timestamp: HybridTimestamp,
}

/// Events surfaced to the application.
#[derive(Debug)]
pub enum SyncEvent {
    /// A link to a peer came up.
    LinkUp {
        /// Address of the link.
        endpoint: String,
    },
    /// A link to a peer went down.
    LinkDown {
        /// Address of the link.
        endpoint: String,
        /// Why it went down.
        reason: String,
    },
    /// A remote change was accepted into local state.
    ChangeApplied {
        /// The changed key.
        key: String,
        /// Timestamp of the winning write.
        timestamp: HybridTimestamp,
        /// Address of the link the change arrived on.
        endpoint: String,
    },
    /// Delivery of an outbound message to one link failed.
    SendFailed {
        /// Address of the failed link.
        endpoint: String,
        /// Error message describing the failure.
        error: String,
    },
}

/// A peer-to-peer state synchronization engine.
///
/// Cheap to clone behind `Arc`s; all methods take `&self`.
pub struct SyncEngine<C: Connector + 'static> {
    local_id: EndpointId,
    clock: ClockHandle,
    nodes: Arc<DashMap<String, Node>>,
    manager: Arc<ConnectionManager<C>>,
}

impl<C: Connector + 'static> SyncEngine<C> {
    /// Start the engine: spin up the connection manager and the event
    /// pump, and return the application event stream alongside.
    pub fn start(
        config: EngineConfig,
        connector: C,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SyncEvent>), EngineError> {
        config.validate()?;

        let local_id = EndpointId::random();
        info!(%local_id, "starting sync engine");

        let clock = ClockHandle::new();
        let nodes: Arc<DashMap<String, Node>> = Arc::new(DashMap::new());
        let (manager, peer_rx) = ConnectionManager::start(config, connector, local_id);
        let manager = Arc::new(manager);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(
            peer_rx,
            Arc::clone(&nodes),
            clock.clone(),
            Arc::clone(&manager),
            events_tx,
        ));

        Ok((
            Self {
                local_id,
                clock,
                nodes,
                manager,
            },
            events_rx,
        ))
    }

    /// This node's identity.
    pub fn local_id(&self) -> EndpointId {
        self.local_id
    }

    /// Read a key's current value.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.nodes.get(key).map(|node| node.value.clone())
    }

    /// Read a key's current timestamp.
    pub fn timestamp(&self, key: &str) -> Option<HybridTimestamp> {
        self.nodes.get(key).map(|node| node.timestamp)
    }

    /// Number of keys with local state.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no key has local state yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Write a key locally and broadcast the change to connected peers.
    ///
    /// The write is stamped with a fresh clock reading, which orders
    /// after every timestamp this node has seen, so local writes always
    /// win resolution against current state.
    pub async fn put(&self, key: impl Into<String>, value: Vec<u8>) -> WriteOutcome {
        let key = key.into();
        let timestamp = self.clock.now();
        let incoming = IncomingChange::new(value.clone(), timestamp);

        let accepted = apply_change(&self.nodes, &key, incoming);
        if accepted {
            let message = WireMessage::Change(Change {
                key,
                value,
                timestamp,
            });
            self.manager.broadcast(&message).await;
        }
        WriteOutcome {
            accepted,
            timestamp,
        }
    }

    /// The underlying connection manager.
    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    /// Announce departure to connected peers and tear everything down.
    pub async fn shutdown(&self) {
        let bye = WireMessage::Bye(Bye { reason: None });
        self.manager.broadcast(&bye).await;
        self.manager.shutdown();
    }
}

/// Resolve a change against a key's state, applying it if it wins.
///
/// The dashmap entry guard is held across resolve-then-apply, so two
/// racing changes to one key serialize and the loser resolves against
/// the winner's state rather than a stale snapshot.
fn apply_change(nodes: &DashMap<String, Node>, key: &str, incoming: IncomingChange) -> bool {
    match nodes.entry(key.to_string()) {
        dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
            if resolve(Some(occupied.get()), &incoming).is_accepted() {
                occupied.get_mut().apply(incoming);
                true
            } else {
                false
            }
        }
        dashmap::mapref::entry::Entry::Vacant(vacant) => {
            vacant.insert(Node::new(key.to_string(), incoming));
            true
        }
    }
}

/// Translate manager events into application events, absorbing remote
/// changes along the way. Exits when the manager's event stream closes.
async fn pump_events<C: Connector + 'static>(
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    nodes: Arc<DashMap<String, Node>>,
    clock: ClockHandle,
    manager: Arc<ConnectionManager<C>>,
    events: mpsc::UnboundedSender<SyncEvent>,
) {
    while let Some(event) = peer_rx.recv().await {
        match event {
            PeerEvent::LinkUp { endpoint } => {
                let _ = events.send(SyncEvent::LinkUp { endpoint });
            }
            PeerEvent::LinkDown { endpoint, reason } => {
                let _ = events.send(SyncEvent::LinkDown { endpoint, reason });
            }
            PeerEvent::ReconnectFailed {
                endpoint,
                attempt,
                error,
            } => {
                debug!(%endpoint, attempt, %error, "reconnect attempt failed");
            }
            PeerEvent::SendFailed { endpoint, error } => {
                let _ = events.send(SyncEvent::SendFailed { endpoint, error });
            }
            PeerEvent::Message { endpoint, message } => {
                handle_message(&nodes, &clock, &manager, &events, endpoint, message).await;
            }
        }
    }
    debug!("engine event pump stopped");
}

async fn handle_message<C: Connector + 'static>(
    nodes: &DashMap<String, Node>,
    clock: &ClockHandle,
    manager: &ConnectionManager<C>,
    events: &mpsc::UnboundedSender<SyncEvent>,
    endpoint: String,
    message: WireMessage,
) {
    match message {
        WireMessage::Change(change) => {
            // Advance the clock before resolving, so any write this node
            // makes afterwards orders after the remote write whether or
            // not the remote write is accepted here.
            clock.update(&change.timestamp);

            let incoming = IncomingChange::new(change.value.clone(), change.timestamp);
            if apply_change(nodes, &change.key, incoming) {
                let _ = events.send(SyncEvent::ChangeApplied {
                    key: change.key.clone(),
                    timestamp: change.timestamp,
                    endpoint: endpoint.clone(),
                });
                // Relay the winner onward, but never back where it came
                // from. Rejected changes are not relayed, so repeated
                // deliveries cannot circulate.
                manager
                    .broadcast_except(&WireMessage::Change(change), Some(&endpoint))
                    .await;
            } else {
                debug!(%endpoint, "stale or duplicate change dropped");
            }
        }
        WireMessage::Announce(announce) => {
            debug!(%endpoint, peer = %announce.endpoint, "peer announced");
        }
        WireMessage::Bye(bye) => {
            debug!(%endpoint, reason = ?bye.reason, "peer said goodbye");
        }
    }
}
