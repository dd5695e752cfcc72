//! Frame encoders feeding the WebRTC sample track

use bytes::Bytes;
use openh264::encoder::Encoder;
use openh264::formats::{RgbSliceU8, YUVBuffer};
use tracing::debug;

use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// Converts raw frames into codec bitstream samples
pub trait FrameEncoder: Send {
    /// Encode one frame; `None` when the encoder skipped it
    fn encode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>>;

    /// Human readable encoder name
    fn name(&self) -> &'static str;
}

/// Software H.264 encoder (OpenH264), Annex B output
pub struct H264Encoder {
    encoder: Encoder,
    resolution: Resolution,
    rgb: Vec<u8>,
}

impl H264Encoder {
    pub fn new(resolution: Resolution) -> Result<Self> {
        if !resolution.is_valid() {
            return Err(AppError::EncoderError(format!(
                "Unsupported resolution {}",
                resolution
            )));
        }
        let encoder = Encoder::new()
            .map_err(|e| AppError::EncoderError(format!("Failed to create H264 encoder: {}", e)))?;
        debug!("Created OpenH264 encoder for {}", resolution);

        Ok(Self {
            encoder,
            resolution,
            rgb: Vec::with_capacity(PixelFormat::Rgb24.frame_size(resolution)),
        })
    }
}

impl FrameEncoder for H264Encoder {
    fn encode(&mut self, frame: &VideoFrame) -> Result<Option<Bytes>> {
        if frame.resolution != self.resolution || frame.format != PixelFormat::Bgr24 {
            return Err(AppError::EncoderError(format!(
                "Expected BGR24 {}, got {} {}",
                self.resolution, frame.format, frame.resolution
            )));
        }

        bgr_to_rgb(frame.data(), &mut self.rgb);
        let source = RgbSliceU8::new(
            &self.rgb,
            (self.resolution.width as usize, self.resolution.height as usize),
        );
        let yuv = YUVBuffer::from_rgb_source(source);

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| AppError::EncoderError(format!("H264 encode failed: {}", e)))?;
        let data = bitstream.to_vec();

        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(data)))
    }

    fn name(&self) -> &'static str {
        "openh264"
    }
}

/// Swap BGR24 into RGB24, reusing `out`
pub fn bgr_to_rgb(bgr: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(bgr.len());
    for px in bgr.chunks_exact(3) {
        out.extend_from_slice(&[px[2], px[1], px[0]]);
    }
}
