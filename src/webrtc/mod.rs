//! WebRTC media session for the bouncing-ball feed
//!
//! Architecture:
//! ```text
//! BallGenerator (latest frame)
//!        |
//!        v
//! BallVideoTrack (90 kHz clock -> H264Encoder -> sample track)
//!        |
//!        v
//! RtcPeer (webrtc-rs PeerConnection)
//!        |
//! Browser <---- SDP / ICE over WebTransport ---- SessionHandler
//! ```
//!
//! The session only sees the [`MediaPeer`] and [`PeerFactory`] traits; engine
//! callbacks arrive as [`PeerEvent`]s on a channel.

pub mod config;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod track;

pub use config::{VideoCodec, WebRtcConfig};
pub use peer::{MediaPeer, PeerEvent, PeerFactory, RtcPeer, RtcPeerFactory};
pub use sdp::prefer_codec;
pub use signaling::{ConnectionState, Decoded, IceCandidate, SignalingMessage};
pub use track::{BallVideoTrack, MediaFrame};
