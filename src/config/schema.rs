use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::video::format::Resolution;

// Re-export WebRtcConfig from webrtc module
pub use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// WebTransport server settings
    pub server: ServerConfig,
    /// Synthetic video settings
    pub video: VideoConfig,
    /// WebRTC session settings
    pub webrtc: WebRtcConfig,
}

impl AppConfig {
    /// Reject configurations the session pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        self.video.validate()?;
        if self.server.bind_port == 0 {
            return Err(AppError::Config("bind_port must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// WebTransport server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (IPv4 or IPv6 literal)
    pub bind_address: String,
    /// UDP port for QUIC
    pub bind_port: u16,
    /// TLS certificate chain (PEM)
    pub certificate: PathBuf,
    /// TLS private key (PEM)
    pub key: PathBuf,
    /// QUIC keep-alive interval in seconds (0 disables)
    pub keep_alive_secs: u64,
    /// Close idle QUIC connections after this many seconds
    pub max_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "::1".to_string(),
            bind_port: 4433,
            certificate: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
            keep_alive_secs: 3,
            max_idle_secs: 30,
        }
    }
}

/// Synthetic video (bouncing ball) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Tick rate of the generator and frame rate of the track
    pub fps: u32,
    /// Ball radius in pixels
    pub radius: i32,
    /// Ball velocity in pixels per tick
    pub velocity: (i32, i32),
    /// Write every rendered frame into this directory (diagnostics)
    pub save_frames_dir: Option<PathBuf>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            radius: 20,
            velocity: (5, 3),
            save_frames_dir: None,
        }
    }
}

impl VideoConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(AppError::Config("fps must be non-zero".to_string()));
        }
        if !self.resolution().is_valid() {
            return Err(AppError::Config(format!(
                "Resolution {} must be non-zero with even dimensions",
                self.resolution()
            )));
        }
        if self.radius <= 0 || 2 * self.radius as u32 >= self.width.min(self.height) {
            return Err(AppError::Config(format!(
                "Radius {} does not fit in {}",
                self.radius,
                self.resolution()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind_address, "::1");
        assert_eq!(config.server.bind_port, 4433);
        assert_eq!(config.video.resolution(), Resolution::new(640, 480));
    }

    #[test]
    fn test_rejects_bad_video() {
        let mut video = VideoConfig {
            fps: 0,
            ..Default::default()
        };
        assert!(video.validate().is_err());

        video.fps = 30;
        video.width = 641;
        assert!(video.validate().is_err());

        video.width = 40;
        video.height = 40;
        video.radius = 20;
        assert!(video.validate().is_err());
    }
}
