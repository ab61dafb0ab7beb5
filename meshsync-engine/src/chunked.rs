//! Chunked message transfer over a peer connection.
//!
//! The send path splits a logical message into frames (meshsync-core)
//! and pushes them one at a time, pausing and retrying on backpressure
//! up to a bounded retry count. Exhausting the retries fails the whole
//! message: partially sent state is discarded, never resumed, and the
//! far end's partial buffer ages out on its idle sweep.
//!
//! The receive path decodes frames at the boundary and feeds them to a
//! [`Reassembler`], yielding a decoded [`WireMessage`] when a logical
//! message completes.

use std::time::Duration;

use meshsync_core::chunk::{split_message, ChunkError, Reassembler};
use meshsync_types::{Frame, FrameKind, MessageId, ProtocolError, WireMessage};
use thiserror::Error;
use tracing::debug;

use crate::transport::{PeerConnection, SendOutcome, TransportError};

/// Tuning for chunked sends.
#[derive(Debug, Clone)]
pub struct ChunkSettings {
    /// Cap on fragments per logical message.
    pub max_fragments: usize,
    /// How many times a blocked fragment send is retried.
    pub send_retries: u32,
    /// Fixed delay between backpressure retries.
    pub send_retry_delay: Duration,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_fragments: meshsync_core::DEFAULT_MAX_FRAGMENTS,
            send_retries: 10,
            send_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Errors from a chunked send.
#[derive(Debug, Error)]
pub enum SendError {
    /// The message was rejected before any frame went out.
    #[error("message rejected: {0}")]
    Rejected(#[from] ChunkError),

    /// Backpressure never cleared within the retry budget.
    #[error("send buffer still full after {retries} retries")]
    Backpressure {
        /// Number of retries that were attempted.
        retries: u32,
    },

    /// The underlying connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The logical message could not be encoded.
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Errors from the inbound frame path.
#[derive(Debug, Error)]
pub enum RecvError {
    /// The frame or the completed payload was malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The frame violated reassembly limits.
    #[error(transparent)]
    Reassembly(#[from] ChunkError),
}

/// Send a logical message as a sequence of frames.
///
/// Returns the message id on success. Fails without sending anything if
/// the message would exceed the fragment cap.
pub async fn send_message<C>(
    conn: &C,
    settings: &ChunkSettings,
    message: &WireMessage,
) -> Result<MessageId, SendError>
where
    C: PeerConnection + ?Sized,
{
    let payload = message.to_bytes()?;
    send_payload(conn, settings, &payload).await
}

/// Send a raw payload as a sequence of frames.
pub async fn send_payload<C>(
    conn: &C,
    settings: &ChunkSettings,
    payload: &[u8],
) -> Result<MessageId, SendError>
where
    C: PeerConnection + ?Sized,
{
    let message_id = MessageId::new();
    let frames = split_message(
        message_id,
        payload,
        conn.max_message_size(),
        settings.max_fragments,
    )?;

    for frame in &frames {
        send_frame(conn, settings, &frame.encode()).await?;
    }
    Ok(message_id)
}

/// Send one frame, retrying on backpressure up to the configured count.
async fn send_frame<C>(conn: &C, settings: &ChunkSettings, bytes: &[u8]) -> Result<(), SendError>
where
    C: PeerConnection + ?Sized,
{
    let mut retries: u32 = 0;
    loop {
        match conn.send(bytes).await? {
            SendOutcome::Sent => return Ok(()),
            SendOutcome::WouldBlock => {
                if retries >= settings.send_retries {
                    return Err(SendError::Backpressure { retries });
                }
                retries += 1;
                debug!(retry = retries, "send buffer full, backing off");
                tokio::time::sleep(settings.send_retry_delay).await;
            }
        }
    }
}

/// What one inbound frame amounted to.
#[derive(Debug)]
pub enum Inbound {
    /// A fragment was buffered; the message is not complete yet.
    Partial,
    /// The frame completed a logical message.
    Completed {
        /// Id of the completed message.
        message_id: MessageId,
        /// The decoded message.
        message: WireMessage,
    },
    /// The far end confirmed complete reassembly of a message we sent.
    Ack {
        /// Id of the acknowledged message.
        message_id: MessageId,
    },
}

/// Decode and absorb one inbound transport message.
///
/// Malformed frames and malformed completed payloads are reported as
/// errors for the caller to log and drop - they never crash the link.
pub fn accept_frame(
    reassembler: &mut Reassembler,
    bytes: &[u8],
    now_ms: u64,
) -> Result<Inbound, RecvError> {
    let frame = Frame::decode(bytes)?;
    if frame.kind == FrameKind::Ack {
        return Ok(Inbound::Ack {
            message_id: frame.message_id,
        });
    }
    match reassembler.insert(&frame, now_ms)? {
        Some(payload) => {
            let message = WireMessage::from_bytes(&payload)?;
            Ok(Inbound::Completed {
                message_id: frame.message_id,
                message,
            })
        }
        None => Ok(Inbound::Partial),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockConnection;
    use meshsync_core::DEFAULT_MAX_FRAGMENTS;
    use meshsync_types::{Change, HybridTimestamp, FRAME_HEADER_SIZE};

    fn fast_settings() -> ChunkSettings {
        ChunkSettings {
            max_fragments: DEFAULT_MAX_FRAGMENTS,
            send_retries: 3,
            send_retry_delay: Duration::from_millis(1),
        }
    }

    fn change_message(key: &str, value: &[u8]) -> WireMessage {
        WireMessage::Change(Change {
            key: key.into(),
            value: value.to_vec(),
            timestamp: HybridTimestamp::new(100, 1),
        })
    }

    #[tokio::test]
    async fn message_roundtrip_over_pair() {
        let (a, b) = MockConnection::pair(FRAME_HEADER_SIZE + 16);
        let message = change_message("k", &[7u8; 100]);

        let sent_id = send_message(&a, &fast_settings(), &message).await.unwrap();
        assert!(a.sent_count() > 1, "payload should need several frames");

        let mut reassembler = Reassembler::new(DEFAULT_MAX_FRAGMENTS);
        loop {
            let bytes = b.recv().await.unwrap();
            match accept_frame(&mut reassembler, &bytes, 0).unwrap() {
                Inbound::Partial => continue,
                Inbound::Completed {
                    message_id,
                    message: received,
                } => {
                    assert_eq!(message_id, sent_id);
                    assert_eq!(received, message);
                    break;
                }
                Inbound::Ack { .. } => panic!("unexpected ack"),
            }
        }
    }

    #[tokio::test]
    async fn backpressure_clears_within_budget() {
        let conn = MockConnection::new(FRAME_HEADER_SIZE + 64);
        let settings = fast_settings();
        // Exactly the retry budget: initial attempt + 3 retries
        conn.block_sends(settings.send_retries as usize);

        let result = send_payload(&conn, &settings, b"small").await;
        assert!(result.is_ok());
        assert_eq!(conn.sent_count(), 1);
    }

    #[tokio::test]
    async fn backpressure_fails_after_exact_retry_count() {
        let conn = MockConnection::new(FRAME_HEADER_SIZE + 64);
        let settings = fast_settings();
        // One more blocked attempt than the budget allows
        conn.block_sends(settings.send_retries as usize + 1);

        let result = send_payload(&conn, &settings, b"small").await;
        match result {
            Err(SendError::Backpressure { retries }) => {
                assert_eq!(retries, settings.send_retries)
            }
            other => panic!("expected backpressure failure, got {other:?}"),
        }
        assert_eq!(conn.sent_count(), 0, "nothing should have gone out");
    }

    #[tokio::test]
    async fn oversized_message_sends_nothing() {
        let conn = MockConnection::new(FRAME_HEADER_SIZE + 8);
        let settings = ChunkSettings {
            max_fragments: 100,
            ..fast_settings()
        };
        // 150 fragments needed against a 100-fragment cap
        let payload = vec![0u8; 8 * 150];

        let result = send_payload(&conn, &settings, &payload).await;
        assert!(matches!(
            result,
            Err(SendError::Rejected(ChunkError::TooManyFragments {
                required: 150,
                max: 100
            }))
        ));
        assert_eq!(conn.sent_count(), 0);
    }

    #[tokio::test]
    async fn failed_send_discards_partial_message() {
        let conn = MockConnection::new(FRAME_HEADER_SIZE + 8);
        let settings = ChunkSettings {
            send_retries: 0,
            ..fast_settings()
        };
        let payload = vec![1u8; 24]; // three fragments

        // Fragment 0 goes out, fragment 1 fails
        conn.fail_send_at(1);
        let result = send_payload(&conn, &settings, &payload).await;
        assert!(matches!(result, Err(SendError::Transport(_))));
        assert_eq!(conn.sent_count(), 1);

        // A fresh send is a brand new message with its own id
        let id = send_payload(&conn, &settings, &payload).await.unwrap();
        let frames: Vec<Frame> = conn
            .sent_messages()
            .iter()
            .map(|bytes| Frame::decode(bytes).unwrap())
            .collect();
        let new_frames: Vec<&Frame> =
            frames.iter().filter(|f| f.message_id == id).collect();
        assert_eq!(new_frames.len(), 3, "retry restarts from fragment zero");
        assert_eq!(new_frames[0].seq, 0);
    }

    #[tokio::test]
    async fn ack_frames_are_surfaced() {
        let mut reassembler = Reassembler::new(100);
        let id = MessageId::new();
        let bytes = Frame::ack(id).encode();

        match accept_frame(&mut reassembler, &bytes, 0).unwrap() {
            Inbound::Ack { message_id } => assert_eq!(message_id, id),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error_not_a_crash() {
        let mut reassembler = Reassembler::new(100);
        let result = accept_frame(&mut reassembler, &[0xFF; 4], 0);
        assert!(matches!(result, Err(RecvError::Protocol(_))));
    }

    #[tokio::test]
    async fn completed_garbage_payload_is_rejected() {
        let mut reassembler = Reassembler::new(100);
        // A single final frame whose payload is not a WireMessage
        let frame = Frame::data(MessageId::new(), 0, 255, true, vec![0xC1, 0xC1]);
        let result = accept_frame(&mut reassembler, &frame.encode(), 0);
        assert!(matches!(result, Err(RecvError::Protocol(_))));
    }
}
