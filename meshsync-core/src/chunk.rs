//! Fragmentation and reassembly of logical messages.
//!
//! Peer connections carry bounded-size messages, so a logical payload is
//! split into [`Frame`]s that each fit `max_frame_size` including the
//! fixed header. A message may never need more than `max_fragments`
//! frames; oversized payloads are rejected before any frame is built.
//!
//! The receive side buffers fragments per message id and tolerates
//! out-of-order arrival. Partial messages that go idle are discarded by
//! [`Reassembler::sweep`], which the caller drives with its own clock -
//! this module performs no I/O and reads no timers.

use std::collections::{BTreeMap, HashMap};

use meshsync_types::{Frame, FrameKind, MessageId, FRAME_HEADER_SIZE, PROGRESS_COMPLETE};
use thiserror::Error;

/// Default cap on fragments per logical message.
pub const DEFAULT_MAX_FRAGMENTS: usize = 100;

/// Errors from fragmentation and reassembly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// The payload would need more fragments than the configured cap.
    #[error("message needs {required} fragments, cap is {max}")]
    TooManyFragments {
        /// Fragments the payload would require.
        required: usize,
        /// Configured fragment cap.
        max: usize,
    },

    /// The frame size leaves no room for payload after the header.
    #[error("frame size {max_frame} too small for {header}-byte header")]
    FrameTooSmall {
        /// Configured maximum frame size.
        max_frame: usize,
        /// Fixed header size.
        header: usize,
    },

    /// A received fragment's sequence index exceeds the fragment cap.
    #[error("fragment seq {seq} out of range (cap {max})")]
    SequenceOutOfRange {
        /// The offending sequence index.
        seq: u8,
        /// Configured fragment cap.
        max: usize,
    },
}

/// Split a logical message into data frames, in sequence order.
///
/// Each frame's total encoded size (header + payload) fits within
/// `max_frame_size`. An empty payload still produces one final frame.
/// Fails before building any frame if the payload would exceed
/// `max_fragments`.
pub fn split_message(
    message_id: MessageId,
    payload: &[u8],
    max_frame_size: usize,
    max_fragments: usize,
) -> Result<Vec<Frame>, ChunkError> {
    if max_frame_size <= FRAME_HEADER_SIZE {
        return Err(ChunkError::FrameTooSmall {
            max_frame: max_frame_size,
            header: FRAME_HEADER_SIZE,
        });
    }
    // seq is a single byte; the cap must stay below 256 regardless of config
    let max_fragments = max_fragments.min(u8::MAX as usize + 1);

    let capacity = max_frame_size - FRAME_HEADER_SIZE;
    let required = payload.len().div_ceil(capacity).max(1);
    if required > max_fragments {
        return Err(ChunkError::TooManyFragments {
            required,
            max: max_fragments,
        });
    }

    let mut frames = Vec::with_capacity(required);
    for (index, fragment) in split_fragments(payload, capacity, required).enumerate() {
        let is_final = index + 1 == required;
        let progress = ((index + 1) * PROGRESS_COMPLETE as usize / required) as u8;
        frames.push(Frame::data(
            message_id,
            index as u8,
            progress,
            is_final,
            fragment.to_vec(),
        ));
    }
    Ok(frames)
}

/// Iterate fragment slices, yielding exactly `count` items (one empty
/// slice for an empty payload).
fn split_fragments(
    payload: &[u8],
    capacity: usize,
    count: usize,
) -> impl Iterator<Item = &[u8]> + '_ {
    (0..count).map(move |i| {
        let start = i * capacity;
        let end = (start + capacity).min(payload.len());
        &payload[start..end]
    })
}

/// A partially reassembled message.
#[derive(Debug, Clone)]
struct PartialMessage {
    /// Fragments keyed by sequence index; BTreeMap iteration order is
    /// sequence order, which is what concatenation needs.
    fragments: BTreeMap<u8, Vec<u8>>,
    /// Sequence index of the final fragment, once seen.
    final_seq: Option<u8>,
    /// Caller-supplied clock reading of the last fragment arrival.
    last_activity_ms: u64,
}

/// Reassembles inbound frames into logical messages.
///
/// Frames are demultiplexed by message id. A message completes when its
/// final fragment has arrived and every sequence index up to it is
/// present; the concatenated payload is returned once and the buffer for
/// that id is released. Incomplete messages accumulate until discarded
/// by [`sweep`](Self::sweep).
#[derive(Debug, Clone)]
pub struct Reassembler {
    max_fragments: usize,
    pending: HashMap<MessageId, PartialMessage>,
}

impl Reassembler {
    /// Create a reassembler with the given fragment cap.
    pub fn new(max_fragments: usize) -> Self {
        Self {
            max_fragments: max_fragments.min(u8::MAX as usize + 1),
            pending: HashMap::new(),
        }
    }

    /// Feed one inbound frame, with the caller's current clock reading.
    ///
    /// Returns the complete payload when this frame finishes a message.
    /// Ack frames and duplicate fragments are absorbed without effect.
    pub fn insert(&mut self, frame: &Frame, now_ms: u64) -> Result<Option<Vec<u8>>, ChunkError> {
        if frame.kind != FrameKind::Data {
            return Ok(None);
        }
        if frame.seq as usize >= self.max_fragments {
            return Err(ChunkError::SequenceOutOfRange {
                seq: frame.seq,
                max: self.max_fragments,
            });
        }

        let entry = self
            .pending
            .entry(frame.message_id)
            .or_insert_with(|| PartialMessage {
                fragments: BTreeMap::new(),
                final_seq: None,
                last_activity_ms: now_ms,
            });
        entry.last_activity_ms = now_ms;
        entry.fragments.entry(frame.seq).or_insert_with(|| frame.payload.clone());
        if frame.is_final() {
            entry.final_seq = Some(frame.seq);
        }

        let complete = match entry.final_seq {
            Some(final_seq) => {
                entry.fragments.len() == final_seq as usize + 1
                    && entry.fragments.keys().next_back() == Some(&final_seq)
            }
            None => false,
        };
        if !complete {
            return Ok(None);
        }

        let entry = self
            .pending
            .remove(&frame.message_id)
            .expect("entry present");
        let mut payload = Vec::new();
        for fragment in entry.fragments.into_values() {
            payload.extend_from_slice(&fragment);
        }
        Ok(Some(payload))
    }

    /// Discard partial messages idle for longer than `idle_timeout_ms`.
    ///
    /// Returns how many were discarded. Orphaned partials are best-effort
    /// garbage, not errors.
    pub fn sweep(&mut self, now_ms: u64, idle_timeout_ms: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, partial| now_ms.saturating_sub(partial.last_activity_ms) < idle_timeout_ms);
        before - self.pending.len()
    }

    /// Number of messages currently awaiting more fragments.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
