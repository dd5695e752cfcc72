//! Synthetic video source
//!
//! ```text
//! BallGenerator (tick thread)
//!   render_ball -> [FrameDumper] -> BallState::advance -> publish
//!        |
//!        v
//! snapshot_frame() / snapshot_position()
//!        |                      |
//!        v                      v
//! BallVideoTrack (WebRTC)   SessionHandler (coords measurement)
//! ```

pub mod ball;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod generator;
pub mod render;

pub use ball::{measurement_error, BallState};
pub use encoder::{FrameEncoder, H264Encoder};
pub use format::{PixelFormat, Resolution};
pub use frame::VideoFrame;
pub use generator::BallGenerator;
