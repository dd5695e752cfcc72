//! Pixel format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel formats produced or consumed by the video pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// BGR24 packed format (3 bytes per pixel), produced by the ball renderer
    Bgr24,
    /// RGB24 packed format (3 bytes per pixel), fed to the H264 encoder
    Rgb24,
}

impl PixelFormat {
    /// Calculate expected frame size for a given resolution
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => pixels * 3,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Rgb24 => "RGB24",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Check if resolution can be encoded (non-zero, even dimensions)
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
