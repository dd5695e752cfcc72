//! Video frame data structures

use bytes::Bytes;

use super::format::{PixelFormat, Resolution};

/// A raw video frame with metadata
///
/// Pixel data is held in an immutable [`Bytes`] buffer, so clones are cheap
/// and readers never observe a frame while it is being rendered.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw frame data
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Frame sequence number
    pub sequence: u64,
}

impl VideoFrame {
    /// Create a new video frame
    pub fn new(data: Bytes, resolution: Resolution, format: PixelFormat, sequence: u64) -> Self {
        Self {
            data,
            resolution,
            format,
            sequence,
        }
    }

    /// Create a frame from a Vec<u8>
    pub fn from_vec(
        data: Vec<u8>,
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self::new(Bytes::from(data), resolution, format, sequence)
    }

    /// All-black frame of the given dimensions, used before the first render
    pub fn black(resolution: Resolution, format: PixelFormat) -> Self {
        Self::from_vec(vec![0u8; format.frame_size(resolution)], resolution, format, 0)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
