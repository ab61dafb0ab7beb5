//! Mock transport for testing.
//!
//! [`MockConnection`] captures sent messages and delivers inbound ones,
//! either standalone (unit tests feed it by hand) or as one half of an
//! in-memory pair. [`MockHub`] rendezvouses two dialing sides onto the
//! same pair so integration tests can wire whole engines together.

use super::{Connector, PeerConnection, SendOutcome, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Default maximum message size for mock connections.
pub const DEFAULT_MOCK_MESSAGE_SIZE: usize = 256;

#[derive(Debug, Default)]
struct ConnState {
    open: bool,
    sent: Vec<Vec<u8>>,
    inbox: VecDeque<Vec<u8>>,
    block_sends: usize,
    fail_next_send: Option<String>,
    fail_send_at: Option<usize>,
}

#[derive(Debug, Default)]
struct Side {
    state: Mutex<ConnState>,
    signal: Notify,
}

impl Side {
    fn new_open() -> Arc<Self> {
        let side = Side::default();
        side.state.lock().unwrap().open = true;
        Arc::new(side)
    }
}

/// Mock peer connection.
///
/// Clones share state, so a test can keep a handle to a connection that
/// was handed to the code under test.
#[derive(Debug, Clone)]
pub struct MockConnection {
    side: Arc<Side>,
    peer: Option<Arc<Side>>,
    max_message_size: usize,
}

impl MockConnection {
    /// Create a standalone open connection that only captures sends.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            side: Side::new_open(),
            peer: None,
            max_message_size,
        }
    }

    /// Create two connected halves; sends on one arrive on the other.
    pub fn pair(max_message_size: usize) -> (Self, Self) {
        let a = Side::new_open();
        let b = Side::new_open();
        (
            Self {
                side: Arc::clone(&a),
                peer: Some(Arc::clone(&b)),
                max_message_size,
            },
            Self {
                side: b,
                peer: Some(a),
                max_message_size,
            },
        )
    }

    /// Queue a message to be returned by a later `recv()` call.
    pub fn push_inbound(&self, data: Vec<u8>) {
        let mut state = self.side.state.lock().unwrap();
        state.inbox.push_back(data);
        self.side.signal.notify_one();
    }

    /// Get all messages that were sent on this half.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.side.state.lock().unwrap().sent.clone()
    }

    /// Number of send attempts that were accepted.
    pub fn sent_count(&self) -> usize {
        self.side.state.lock().unwrap().sent.len()
    }

    /// Get the last message that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.side.state.lock().unwrap().sent.last().cloned()
    }

    /// Make the next `n` sends report a full buffer (WouldBlock).
    pub fn block_sends(&self, n: usize) {
        self.side.state.lock().unwrap().block_sends = n;
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.side.state.lock().unwrap().fail_next_send = Some(error.to_string());
    }

    /// Fail the send once `index` messages have already been accepted.
    ///
    /// `fail_send_at(1)` lets the first send through and fails the second.
    pub fn fail_send_at(&self, index: usize) {
        self.side.state.lock().unwrap().fail_send_at = Some(index);
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn send(&self, data: &[u8]) -> Result<SendOutcome, TransportError> {
        {
            let mut state = self.side.state.lock().unwrap();

            if !state.open {
                return Err(TransportError::NotConnected);
            }
            if state.block_sends > 0 {
                state.block_sends -= 1;
                return Ok(SendOutcome::WouldBlock);
            }
            if let Some(error) = state.fail_next_send.take() {
                return Err(TransportError::SendFailed(error));
            }
            if state.fail_send_at == Some(state.sent.len()) {
                state.fail_send_at = None;
                return Err(TransportError::SendFailed("scripted failure".into()));
            }

            state.sent.push(data.to_vec());
        }

        if let Some(peer) = &self.peer {
            let mut peer_state = peer.state.lock().unwrap();
            if peer_state.open {
                peer_state.inbox.push_back(data.to_vec());
                peer.signal.notify_one();
            }
        }
        Ok(SendOutcome::Sent)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        loop {
            {
                let mut state = self.side.state.lock().unwrap();
                if let Some(data) = state.inbox.pop_front() {
                    return Ok(data);
                }
                if !state.open {
                    return Err(TransportError::ConnectionClosed);
                }
            }
            self.side.signal.notified().await;
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn is_open(&self) -> bool {
        self.side.state.lock().unwrap().open
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.side.state.lock().unwrap().open = false;
        self.side.signal.notify_one();
        if let Some(peer) = &self.peer {
            peer.state.lock().unwrap().open = false;
            peer.signal.notify_one();
        }
        Ok(())
    }
}

/// Rendezvous point pairing two dialing sides onto one connection.
///
/// When `a` connects to `"b"` and `b` connects to `"a"`, both get halves
/// of the same in-memory pair.
#[derive(Debug, Default)]
pub struct MockHub {
    pending: Mutex<HashMap<String, MockConnection>>,
}

impl MockHub {
    /// Create a new hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a connector dialing out of this hub under `name`.
    pub fn connector(self: &Arc<Self>, name: &str) -> MockConnector {
        MockConnector {
            name: name.to_string(),
            hub: Some(Arc::clone(self)),
            max_message_size: DEFAULT_MOCK_MESSAGE_SIZE,
            created: Arc::new(Mutex::new(Vec::new())),
            fail_connects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn take_or_create(&self, local: &str, remote: &str, max_size: usize) -> MockConnection {
        let key = if local < remote {
            format!("{local}|{remote}")
        } else {
            format!("{remote}|{local}")
        };
        let mut pending = self.pending.lock().unwrap();
        if let Some(existing) = pending.remove(&key) {
            return existing;
        }
        let (mine, theirs) = MockConnection::pair(max_size);
        pending.insert(key, theirs);
        mine
    }
}

/// Mock connector with scriptable failures and a registry of every
/// connection it produced.
#[derive(Debug, Clone)]
pub struct MockConnector {
    name: String,
    hub: Option<Arc<MockHub>>,
    max_message_size: usize,
    created: Arc<Mutex<Vec<(String, MockConnection)>>>,
    fail_connects: Arc<Mutex<HashMap<String, u32>>>,
}

impl MockConnector {
    /// Create a connector whose connections capture sends but have no
    /// far end.
    pub fn standalone() -> Self {
        Self {
            name: "standalone".to_string(),
            hub: None,
            max_message_size: DEFAULT_MOCK_MESSAGE_SIZE,
            created: Arc::new(Mutex::new(Vec::new())),
            fail_connects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set the maximum message size for produced connections.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Make the next `n` connects to `address` fail.
    pub fn fail_connects(&self, address: &str, n: u32) {
        self.fail_connects
            .lock()
            .unwrap()
            .insert(address.to_string(), n);
    }

    /// All connections produced so far, with the address each was
    /// dialed to.
    pub fn connections(&self) -> Vec<(String, MockConnection)> {
        self.created.lock().unwrap().clone()
    }

    /// The most recent connection dialed to `address`.
    pub fn connection_to(&self, address: &str) -> Option<MockConnection> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(addr, _)| addr == address)
            .map(|(_, conn)| conn.clone())
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(&self, address: &str) -> Result<MockConnection, TransportError> {
        {
            let mut failures = self.fail_connects.lock().unwrap();
            if let Some(remaining) = failures.get_mut(address) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(TransportError::ConnectionFailed(format!(
                        "scripted failure to {address}"
                    )));
                }
            }
        }

        let conn = match &self.hub {
            Some(hub) => hub.take_or_create(&self.name, address, self.max_message_size),
            None => MockConnection::new(self.max_message_size),
        };
        self.created
            .lock()
            .unwrap()
            .push((address.to_string(), conn.clone()));
        Ok(conn)
    }
}
