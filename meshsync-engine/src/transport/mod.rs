//! Transport abstraction for meshsync.
//!
//! This module provides a pluggable peer-connection layer that abstracts
//! the underlying connection mechanism (QUIC, WebRTC data channels, mock
//! for testing).
//!
//! # Design
//!
//! A [`PeerConnection`] carries discrete messages up to a fixed maximum
//! size and may report backpressure on send. A [`Connector`] dials an
//! endpoint address and yields a connection; endpoint discovery itself is
//! an external collaborator - the manager only consumes addresses.
//!
//! # Example
//!
//! ```ignore
//! let conn = connector.connect("relay-0.example:4433").await?;
//! match conn.send(&frame_bytes).await? {
//!     SendOutcome::Sent => {}
//!     SendOutcome::WouldBlock => { /* retry after a delay */ }
//! }
//! ```

mod mock;

pub use mock::{MockConnection, MockConnector, MockHub};

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was handed to the connection.
    Sent,
    /// The connection's send buffer is full; retry later.
    WouldBlock,
}

/// One established peer connection carrying discrete messages.
///
/// Per-connection message delivery is assumed ordered; across
/// connections there is no ordering guarantee.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Try to send one message (at most [`max_message_size`] bytes).
    ///
    /// Returns [`SendOutcome::WouldBlock`] when the outbound buffer is
    /// full; the message was not sent and may be retried.
    ///
    /// [`max_message_size`]: Self::max_message_size
    async fn send(&self, data: &[u8]) -> Result<SendOutcome, TransportError>;

    /// Receive the next inbound message.
    ///
    /// Waits until data is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Maximum single-message size in bytes for this connection.
    fn max_message_size(&self) -> usize;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Dials endpoint addresses into peer connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The connection type this connector produces.
    type Conn: PeerConnection + 'static;

    /// Connect to the endpoint at the given address.
    async fn connect(&self, address: &str) -> Result<Self::Conn, TransportError>;
}
