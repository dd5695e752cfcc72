//! Reassembly of one-message-per-stream payloads
//!
//! A buffer lives only while its stream is open and incomplete. It is
//! removed when the stream ends (whatever the payload turns out to be) or
//! when the stream is reset. Data for a stream that was reset or overflowed
//! is ignored until that stream's end. Only the most recent
//! [`MAX_TOMBSTONES`] such streams are remembered; a reset stream never
//! delivers its end, so older entries are evicted.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

/// Largest accepted signaling message (an SDP offer is a few KiB)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Discarded stream ids remembered at once
pub const MAX_TOMBSTONES: usize = 64;

/// Result of feeding a chunk into [`StreamBuffers`]
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// More data expected
    Pending,
    /// Stream ended; the complete payload
    Complete(Bytes),
    /// Chunk dropped (stream reset or message too large)
    Discarded,
}

/// Partial payloads keyed by stream id
#[derive(Debug)]
pub struct StreamBuffers {
    buffers: HashMap<u64, BytesMut>,
    discarded: VecDeque<u64>,
    max_size: usize,
}

impl Default for StreamBuffers {
    fn default() -> Self {
        Self::with_limit(MAX_MESSAGE_SIZE)
    }
}

impl StreamBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_size: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            discarded: VecDeque::with_capacity(MAX_TOMBSTONES),
            max_size,
        }
    }

    /// Append a chunk; on `fin` the buffer is removed and returned
    pub fn push(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Push {
        if let Some(pos) = self.discarded.iter().position(|id| *id == stream_id) {
            if fin {
                self.discarded.remove(pos);
            }
            return Push::Discarded;
        }

        let buffered = self.buffers.get(&stream_id).map_or(0, |b| b.len());
        if buffered + data.len() > self.max_size {
            self.buffers.remove(&stream_id);
            if !fin {
                self.discard(stream_id);
            }
            return Push::Discarded;
        }

        if fin {
            let mut buffer = self.buffers.remove(&stream_id).unwrap_or_default();
            buffer.extend_from_slice(data);
            return Push::Complete(buffer.freeze());
        }

        self.buffers
            .entry(stream_id)
            .or_default()
            .extend_from_slice(data);
        Push::Pending
    }

    /// Drop the stream's buffer; returns whether one existed
    pub fn reset(&mut self, stream_id: u64) -> bool {
        self.discard(stream_id);
        self.buffers.remove(&stream_id).is_some()
    }

    /// Number of streams with buffered data
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.discarded.clear();
    }

    fn discard(&mut self, stream_id: u64) {
        if self.discarded.contains(&stream_id) {
            return;
        }
        if self.discarded.len() == MAX_TOMBSTONES {
            self.discarded.pop_front();
        }
        self.discarded.push_back(stream_id);
    }
}
