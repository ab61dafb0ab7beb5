//! Connection manager.
//!
//! Owns the active link set. Each link gets a driver task that runs the
//! pure [`LinkState`] machine and interprets its actions against the
//! transport: dialing, reconnect timers with backoff, periodic presence
//! refresh, rare proactive recycling, and the inbound read loop.
//!
//! All I/O lives here. State transitions stay in `meshsync-core` where
//! they are tested without a runtime.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use meshsync_core::{EndpointPool, LinkAction, LinkEvent, LinkNotice, LinkState, Reassembler};
use meshsync_types::{Announce, EndpointId, Frame, MessageId, WireMessage};

use crate::chunked::{self, ChunkSettings, Inbound, SendError};
use crate::config::EngineConfig;
use crate::transport::{Connector, PeerConnection};

/// Errors from manager send operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No link exists for the given endpoint address.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The link exists but is not currently connected.
    #[error("link to {0} is down")]
    LinkDown(String),

    /// The chunked send itself failed.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Events surfaced by the manager to its consumer.
#[derive(Debug)]
pub enum PeerEvent {
    /// A link reached the connected state.
    LinkUp {
        /// Address of the link.
        endpoint: String,
    },
    /// A link left the connected state.
    LinkDown {
        /// Address of the link.
        endpoint: String,
        /// Why the link went down.
        reason: String,
    },
    /// A reconnection attempt failed; the link keeps retrying.
    ReconnectFailed {
        /// Address of the link.
        endpoint: String,
        /// Which attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// A complete logical message arrived on a link.
    Message {
        /// Address of the link it arrived on.
        endpoint: String,
        /// The decoded message.
        message: WireMessage,
    },
    /// A broadcast delivery to one link failed.
    SendFailed {
        /// Address of the failed link.
        endpoint: String,
        /// Error message describing the failure.
        error: String,
    },
}

/// Connection slot shared between the driver task and the send paths.
struct LinkShared<T> {
    conn: Mutex<Option<Arc<T>>>,
}

impl<T> LinkShared<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            conn: Mutex::new(None),
        })
    }

    async fn current(&self) -> Option<Arc<T>> {
        self.conn.lock().await.clone()
    }
}

/// Maintains a set of links drawn from the endpoint pool.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    config: Arc<EngineConfig>,
    chunk: ChunkSettings,
    links: Arc<DashMap<String, Arc<LinkShared<C::Conn>>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    shutdown: watch::Sender<bool>,
}

impl<C: Connector + 'static> ConnectionManager<C> {
    /// Start the manager: select endpoints from the pool and spawn one
    /// driver task per active link.
    ///
    /// Returns the manager and the stream of [`PeerEvent`]s.
    pub fn start(
        config: EngineConfig,
        connector: C,
        local_id: EndpointId,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let config = Arc::new(config);
        let connector = Arc::new(connector);
        let chunk = config.chunk_settings();
        let links: Arc<DashMap<String, Arc<LinkShared<C::Conn>>>> = Arc::new(DashMap::new());
        let pool = Arc::new(StdMutex::new(EndpointPool::new(
            config.endpoints.clone(),
            config.active_links,
        )));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let selection = pool.lock().expect("pool mutex poisoned").selection();
        info!(links = selection.len(), "starting connection manager");
        for address in selection {
            let shared = LinkShared::new();
            links.insert(address.clone(), Arc::clone(&shared));
            tokio::spawn(drive_link(LinkDriver {
                connector: Arc::clone(&connector),
                config: Arc::clone(&config),
                local_id,
                links: Arc::clone(&links),
                pool: Arc::clone(&pool),
                shared,
                address,
                events: events_tx.clone(),
                shutdown: shutdown_rx.clone(),
            }));
        }

        (
            Self {
                connector,
                config,
                chunk,
                links,
                events: events_tx,
                shutdown: shutdown_tx,
            },
            events_rx,
        )
    }

    /// Send a message on the link to the given endpoint address.
    pub async fn send(
        &self,
        endpoint: &str,
        message: &WireMessage,
    ) -> Result<MessageId, ManagerError> {
        let shared = self
            .links
            .get(endpoint)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ManagerError::UnknownEndpoint(endpoint.to_string()))?;
        let conn = shared
            .current()
            .await
            .ok_or_else(|| ManagerError::LinkDown(endpoint.to_string()))?;
        Ok(chunked::send_message(conn.as_ref(), &self.chunk, message).await?)
    }

    /// Send a message on every currently connected link.
    ///
    /// Returns the number of links the message was delivered to. Failed
    /// deliveries surface as [`PeerEvent::SendFailed`]; the broadcast
    /// continues past them.
    pub async fn broadcast(&self, message: &WireMessage) -> usize {
        self.broadcast_except(message, None).await
    }

    /// Like [`broadcast`], skipping the named endpoint.
    ///
    /// Used when relaying a message onward so it is not echoed back to
    /// the link it arrived on.
    ///
    /// [`broadcast`]: Self::broadcast
    pub async fn broadcast_except(&self, message: &WireMessage, skip: Option<&str>) -> usize {
        let targets: Vec<(String, Arc<LinkShared<C::Conn>>)> = self
            .links
            .iter()
            .filter(|entry| skip != Some(entry.key().as_str()))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut delivered = 0;
        for (endpoint, shared) in targets {
            let Some(conn) = shared.current().await else {
                continue;
            };
            match chunked::send_message(conn.as_ref(), &self.chunk, message).await {
                Ok(_) => delivered += 1,
                Err(error) => {
                    warn!(%endpoint, %error, "broadcast delivery failed");
                    let _ = self.events.send(PeerEvent::SendFailed {
                        endpoint,
                        error: error.to_string(),
                    });
                }
            }
        }
        delivered
    }

    /// Addresses of links that are currently connected.
    pub async fn connected_endpoints(&self) -> Vec<String> {
        let targets: Vec<(String, Arc<LinkShared<C::Conn>>)> = self
            .links
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut up = Vec::new();
        for (endpoint, shared) in targets {
            if shared.current().await.is_some() {
                up.push(endpoint);
            }
        }
        up
    }

    /// The connector driving this manager's links.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// The configuration this manager was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tear down all links and stop the driver tasks.
    pub fn shutdown(&self) {
        info!("shutting down connection manager");
        let _ = self.shutdown.send(true);
    }
}

/// Everything one link driver task needs.
struct LinkDriver<C: Connector> {
    connector: Arc<C>,
    config: Arc<EngineConfig>,
    local_id: EndpointId,
    links: Arc<DashMap<String, Arc<LinkShared<C::Conn>>>>,
    pool: Arc<StdMutex<EndpointPool>>,
    shared: Arc<LinkShared<C::Conn>>,
    address: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    shutdown: watch::Receiver<bool>,
}

/// Run one link to completion.
///
/// The loop alternates between two phases: drain the event queue through
/// the state machine and execute the resulting actions, then wait on
/// whichever source can produce the next event (reconnect timer, the
/// periodic timers, inbound data, shutdown).
async fn drive_link<C: Connector>(mut driver: LinkDriver<C>) {
    let backoff = driver.config.backoff_policy();
    let chunk = driver.config.chunk_settings();
    let idle_timeout_ms = driver.config.reassembly_idle_timeout_ms;

    let mut state = LinkState::new();
    let mut reassembler = Reassembler::new(driver.config.max_fragments);
    let mut consecutive_failures: u32 = 0;
    let mut reconnect_delay: Option<Duration> = None;
    let mut queue: VecDeque<LinkEvent> = VecDeque::new();
    queue.push_back(LinkEvent::ConnectRequested);

    // The periodic timers belong to the driver, not to any one
    // connection, so they survive reconnects. interval_at skips the
    // immediate first tick a plain interval would fire.
    let mut refresh = interval_at(
        Instant::now() + driver.config.refresh_interval(),
        driver.config.refresh_interval(),
    );
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut recycle = interval_at(
        Instant::now() + driver.config.recycle_interval(),
        driver.config.recycle_interval(),
    );
    recycle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let sweep_period = Duration::from_millis(idle_timeout_ms.max(1));
    let mut sweep = interval_at(Instant::now() + sweep_period, sweep_period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        while let Some(event) = queue.pop_front() {
            let (next, actions) = state.on_event(event, &backoff);
            state = next;
            for action in actions {
                match action {
                    LinkAction::Connect => {
                        execute_connect(&mut driver, &mut consecutive_failures, &mut queue).await;
                    }
                    LinkAction::Disconnect => {
                        if let Some(conn) = driver.shared.conn.lock().await.take() {
                            let _ = conn.close().await;
                        }
                    }
                    LinkAction::SendAnnounce => {
                        let announce = WireMessage::Announce(Announce {
                            endpoint: driver.local_id,
                        });
                        if let Some(conn) = driver.shared.current().await {
                            if let Err(error) =
                                chunked::send_message(conn.as_ref(), &chunk, &announce).await
                            {
                                debug!(address = %driver.address, %error, "announce failed");
                            }
                        }
                    }
                    LinkAction::StartReconnectTimer { delay } => {
                        reconnect_delay = Some(delay);
                    }
                    LinkAction::CancelReconnect => {
                        reconnect_delay = None;
                    }
                    LinkAction::Notify(notice) => {
                        emit_notice(&driver, notice);
                    }
                }
            }
        }

        if matches!(state, LinkState::Down) {
            break;
        }

        if *driver.shutdown.borrow() {
            queue.push_back(LinkEvent::TeardownRequested);
            continue;
        }

        if let Some(delay) = reconnect_delay.take() {
            let mut shutdown = driver.shutdown.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    queue.push_back(LinkEvent::ReconnectTimer);
                }
                _ = shutdown.changed() => {
                    queue.push_back(LinkEvent::TeardownRequested);
                }
            }
            continue;
        }

        if state.is_up() {
            let Some(conn) = driver.shared.current().await else {
                queue.push_back(LinkEvent::LinkLost {
                    reason: "connection slot empty".into(),
                });
                continue;
            };
            let mut shutdown = driver.shutdown.clone();
            tokio::select! {
                _ = shutdown.changed() => {
                    queue.push_back(LinkEvent::TeardownRequested);
                }
                _ = refresh.tick() => {
                    queue.push_back(LinkEvent::RefreshTimer);
                }
                _ = recycle.tick() => {
                    debug!(address = %driver.address, "recycling link");
                    queue.push_back(LinkEvent::RecycleTimer);
                }
                _ = sweep.tick() => {
                    let dropped = reassembler.sweep(now_ms(), idle_timeout_ms);
                    if dropped > 0 {
                        debug!(
                            address = %driver.address,
                            dropped,
                            "discarded stale partial messages"
                        );
                    }
                }
                result = conn.recv() => match result {
                    Ok(bytes) => {
                        handle_inbound(&driver, conn.as_ref(), &mut reassembler, &bytes).await;
                    }
                    Err(error) => {
                        // Drop the dead connection now so sends stop
                        // reaching it while the reconnect is pending.
                        driver.shared.conn.lock().await.take();
                        queue.push_back(LinkEvent::LinkLost {
                            reason: error.to_string(),
                        });
                    }
                },
            }
            continue;
        }

        // Connecting with nothing queued and no timer pending means the
        // machine produced no way forward. Does not happen with the
        // transitions as written.
        warn!(address = %driver.address, ?state, "link driver stalled");
        break;
    }

    if let Some(conn) = driver.shared.conn.lock().await.take() {
        let _ = conn.close().await;
    }
    driver.links.remove(&driver.address);
    debug!(address = %driver.address, "link driver stopped");
}

/// Dial the driver's current address and queue the outcome.
///
/// After `endpoint_failure_threshold` consecutive failures the endpoint
/// is swapped for a fresh pool candidate before the next attempt.
async fn execute_connect<C: Connector>(
    driver: &mut LinkDriver<C>,
    consecutive_failures: &mut u32,
    queue: &mut VecDeque<LinkEvent>,
) {
    match driver.connector.connect(&driver.address).await {
        Ok(conn) => {
            *driver.shared.conn.lock().await = Some(Arc::new(conn));
            *consecutive_failures = 0;
            info!(address = %driver.address, "link connected");
            queue.push_back(LinkEvent::ConnectSucceeded);
        }
        Err(error) => {
            *consecutive_failures += 1;
            if *consecutive_failures >= driver.config.endpoint_failure_threshold {
                rotate_endpoint(driver, consecutive_failures);
            }
            queue.push_back(LinkEvent::ConnectFailed {
                error: error.to_string(),
            });
        }
    }
}

/// Swap the driver onto a replacement endpoint from a rotated pool.
fn rotate_endpoint<C: Connector>(driver: &mut LinkDriver<C>, consecutive_failures: &mut u32) {
    let replacement = {
        let mut pool = driver.pool.lock().expect("pool mutex poisoned");
        pool.rotate();
        let active: Vec<String> = driver
            .links
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        pool.replacement(&active)
    };
    match replacement {
        Some(new_address) => {
            info!(
                old = %driver.address,
                new = %new_address,
                "endpoint unreachable, rotating to replacement"
            );
            driver.links.remove(&driver.address);
            driver
                .links
                .insert(new_address.clone(), Arc::clone(&driver.shared));
            driver.address = new_address;
            *consecutive_failures = 0;
        }
        None => {
            debug!(address = %driver.address, "no replacement endpoint available");
            // Keep retrying the current one; reset so rotation is
            // re-attempted after another full round of failures.
            *consecutive_failures = 0;
        }
    }
}

/// Absorb one inbound transport message.
async fn handle_inbound<C: Connector>(
    driver: &LinkDriver<C>,
    conn: &C::Conn,
    reassembler: &mut Reassembler,
    bytes: &[u8],
) {
    match chunked::accept_frame(reassembler, bytes, now_ms()) {
        Ok(Inbound::Completed {
            message_id,
            message,
        }) => {
            // Best effort, single try. The ack is advisory and the
            // sender never waits for it.
            let ack = Frame::ack(message_id).encode();
            if let Err(error) = conn.send(&ack).await {
                debug!(address = %driver.address, %error, "ack send failed");
            }
            let _ = driver.events.send(PeerEvent::Message {
                endpoint: driver.address.clone(),
                message,
            });
        }
        Ok(Inbound::Ack { message_id }) => {
            debug!(address = %driver.address, %message_id, "delivery confirmed");
        }
        Ok(Inbound::Partial) => {}
        Err(error) => {
            warn!(address = %driver.address, %error, "dropping malformed inbound frame");
        }
    }
}

fn emit_notice<C: Connector>(driver: &LinkDriver<C>, notice: LinkNotice) {
    let event = match notice {
        LinkNotice::Up => PeerEvent::LinkUp {
            endpoint: driver.address.clone(),
        },
        LinkNotice::Down { reason } => PeerEvent::LinkDown {
            endpoint: driver.address.clone(),
            reason,
        },
        LinkNotice::ReconnectFailed { attempt, error } => PeerEvent::ReconnectFailed {
            endpoint: driver.address.clone(),
            attempt,
            error,
        },
    };
    let _ = driver.events.send(event);
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
