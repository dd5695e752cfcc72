//! WebRTC configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WebRTC session configuration
///
/// ICE gathers host candidates only; no STUN or TURN servers are configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// Codec moved to the front of the answer's video format list
    pub preferred_codec: Option<VideoCodec>,
    /// Track ID of the outgoing video track
    pub track_id: String,
    /// Stream ID of the outgoing video track
    pub stream_id: String,
    /// Upper bound on awaiting peer connection close (ms)
    pub close_timeout_ms: u64,
    /// Upper bound on joining the frame generator thread (ms)
    pub stop_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            preferred_codec: Some(VideoCodec::H264),
            track_id: "video0".to_string(),
            stream_id: "bouncecast-stream".to_string(),
            close_timeout_ms: 2000,
            stop_timeout_ms: 500,
        }
    }
}

impl WebRtcConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Codecs the outgoing sample track can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    /// Encoding name as it appears in `a=rtpmap` lines, lowercased
    pub fn rtpmap_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
        }
    }

    /// Get MIME type for this codec
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
        }
    }
}
