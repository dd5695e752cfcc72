//! Per-client signaling sessions
//!
//! One [`SessionHandler`] runs per accepted WebTransport session. It owns the
//! session's ball generator and media peer and drives the offer/answer
//! exchange, candidate relaying and coordinate measurement.

pub mod buffers;
pub mod handler;
pub mod state;

use crate::config::{AppConfig, VideoConfig};
use crate::webrtc::WebRtcConfig;

pub use buffers::{Push, StreamBuffers};
pub use handler::{SessionHandler, SessionStats};
pub use state::SessionState;

/// Settings every session is created with
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub video: VideoConfig,
    pub webrtc: WebRtcConfig,
}

impl From<&AppConfig> for SessionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            video: config.video.clone(),
            webrtc: config.webrtc.clone(),
        }
    }
}
