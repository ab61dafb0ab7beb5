//! Connection management and the sync engine.
//!
//! This crate is where the pure logic of `meshsync-core` meets actual
//! I/O. It provides:
//!
//! - [`transport`]: the [`PeerConnection`]/[`Connector`] traits the
//!   engine talks through, plus in-memory mocks for tests.
//! - [`chunked`]: fragmenting logical messages into transport frames and
//!   reassembling them, with bounded backpressure retries.
//! - [`ConnectionManager`]: one driver task per link, interpreting the
//!   link state machine against the transport.
//! - [`SyncEngine`]: replicated last-writer-wins key-value state over
//!   the managed links.
//!
//! ```no_run
//! use meshsync_engine::{EngineConfig, MockConnector, SyncEngine};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load("meshsync.toml")?;
//! let (engine, mut events) = SyncEngine::start(config, MockConnector::standalone())?;
//!
//! engine.put("status", b"online".to_vec()).await;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunked;
pub mod config;
pub mod engine;
pub mod manager;
pub mod transport;

pub use chunked::{ChunkSettings, Inbound, RecvError, SendError};
pub use config::{ConfigError, EngineConfig};
pub use engine::{ClockHandle, EngineError, SyncEngine, SyncEvent, WriteOutcome};
pub use manager::{ConnectionManager, ManagerError, PeerEvent};
pub use transport::{
    Connector, MockConnection, MockConnector, MockHub, PeerConnection, SendOutcome, TransportError,
};
