//! Error types for meshsync.

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid frame kind discriminator
    #[error("invalid frame kind: {0}")]
    InvalidFrameKind(u8),

    /// Frame shorter than the fixed header
    #[error("frame truncated: {len} bytes, header needs {header}")]
    FrameTruncated {
        /// Number of bytes actually received.
        len: usize,
        /// Size of the fixed frame header.
        header: usize,
    },

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}
