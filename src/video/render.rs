//! Ball frame rendering and diagnostic frame dumps

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::ball::BallState;
use super::encoder::bgr_to_rgb;
use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// Ball color in BGR order (pure green)
pub const BALL_COLOR_BGR: [u8; 3] = [0, 255, 0];

/// Render a black BGR24 frame with a filled ball at the current position
pub fn render_ball(resolution: Resolution, ball: &BallState) -> Vec<u8> {
    let width = resolution.width as i32;
    let height = resolution.height as i32;
    let mut data = vec![0u8; PixelFormat::Bgr24.frame_size(resolution)];

    let r = ball.radius;
    let r2 = r * r;
    let y_range = (ball.y - r).max(0)..=(ball.y + r).min(height - 1);
    for y in y_range {
        let dy = y - ball.y;
        let x_range = (ball.x - r).max(0)..=(ball.x + r).min(width - 1);
        for x in x_range {
            let dx = x - ball.x;
            if dx * dx + dy * dy <= r2 {
                let offset = ((y * width + x) * 3) as usize;
                data[offset..offset + 3].copy_from_slice(&BALL_COLOR_BGR);
            }
        }
    }

    data
}

/// Writes rendered frames as numbered PNG files
pub struct FrameDumper {
    dir: PathBuf,
    count: u64,
    rgb: Vec<u8>,
}

impl FrameDumper {
    /// Create the output directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            count: 0,
            rgb: Vec::new(),
        })
    }

    /// Write one BGR24 frame, returning the file path
    pub fn write(&mut self, resolution: Resolution, bgr: &[u8]) -> Result<PathBuf> {
        let path = self.dir.join(format!("frame_{:05}.png", self.count));
        bgr_to_rgb(bgr, &mut self.rgb);
        let image = RgbImage::from_raw(resolution.width, resolution.height, std::mem::take(&mut self.rgb))
            .ok_or_else(|| {
                AppError::VideoError(format!(
                    "Frame of {} bytes does not match {}",
                    bgr.len(),
                    resolution
                ))
            })?;

        let result = write_png(&path, &image);
        self.rgb = image.into_raw();
        result?;
        self.count += 1;
        Ok(path)
    }

    pub fn frames_written(&self) -> u64 {
        self.count
    }
}

fn write_png(path: &Path, image: &RgbImage) -> Result<()> {
    let out = BufWriter::new(File::create(path)?);
    PngEncoder::new(out)
        .write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
        .map_err(|e| AppError::VideoError(format!("Failed to encode {}: {}", path.display(), e)))
}
