//! Frame - the fixed-width binary wire unit for fragmented messages.
//!
//! A logical message is split into frames small enough to fit a peer
//! connection's maximum message size. The header is a fixed 20-byte
//! binary layout (not MessagePack): decoding must be cheap and must
//! reject malformed input at the boundary before any payload is touched.
//!
//! Layout:
//!
//! | field      | size | meaning                                   |
//! |------------|------|-------------------------------------------|
//! | kind       | 1    | 1 = data, 2 = ack                         |
//! | message_id | 16   | logical message this frame belongs to     |
//! | seq        | 1    | fragment sequence index (0-based)         |
//! | flags      | 1    | bit 0 = final fragment                    |
//! | progress   | 1    | 0-255 saturating completion marker        |
//! | payload    | rest | fragment bytes                            |

use crate::{MessageId, ProtocolError};

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Flag bit marking the final fragment of a message.
pub const FLAG_FINAL: u8 = 0x01;

/// Progress marker value on a completed/final frame.
pub const PROGRESS_COMPLETE: u8 = 255;

/// Frame kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries a fragment of a logical message.
    Data = 1,
    /// Acknowledges complete reassembly of a logical message.
    Ack = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Ack),
            _ => Err(ProtocolError::InvalidFrameKind(value)),
        }
    }
}

/// One bounded-size piece of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Data or ack.
    pub kind: FrameKind,
    /// The logical message this frame belongs to.
    pub message_id: MessageId,
    /// Fragment sequence index. Fragment counts are capped well below
    /// 256, so a single byte is sufficient.
    pub seq: u8,
    /// Fragment flags (see [`FLAG_FINAL`]).
    pub flags: u8,
    /// Saturating 0-255 completion marker; 255 on the final fragment.
    pub progress: u8,
    /// Fragment payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a data frame.
    pub fn data(
        message_id: MessageId,
        seq: u8,
        progress: u8,
        is_final: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: FrameKind::Data,
            message_id,
            seq,
            flags: if is_final { FLAG_FINAL } else { 0 },
            progress,
            payload,
        }
    }

    /// Create an ack frame for a fully reassembled message.
    pub fn ack(message_id: MessageId) -> Self {
        Self {
            kind: FrameKind::Ack,
            message_id,
            seq: 0,
            flags: FLAG_FINAL,
            progress: PROGRESS_COMPLETE,
            payload: Vec::new(),
        }
    }

    /// Whether this frame is marked as the final fragment.
    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }

    /// Encode to wire bytes (fixed header + payload).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(self.message_id.as_bytes());
        out.push(self.seq);
        out.push(self.flags);
        out.push(self.progress);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode from wire bytes, validating the header at the boundary.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTruncated {
                len: bytes.len(),
                header: FRAME_HEADER_SIZE,
            });
        }
        let kind = FrameKind::try_from(bytes[0])?;
        let message_id = MessageId::from_bytes(&bytes[1..17])
            .ok_or_else(|| ProtocolError::InvalidData("bad message id".into()))?;
        Ok(Self {
            kind,
            message_id,
            seq: bytes[17],
            flags: bytes[18],
            progress: bytes[19],
            payload: bytes[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}
