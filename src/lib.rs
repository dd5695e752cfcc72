//! bouncecast - WebTransport-signaled WebRTC streaming
//!
//! Clients open a WebTransport session, send an SDP offer over a
//! unidirectional stream and trickle ICE candidates as datagrams. Each
//! session streams a synthetic bouncing-ball video over WebRTC and answers
//! the client's reported ball coordinates with the measured error distance.

pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
