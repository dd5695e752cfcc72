//! Video track bridging the ball generator into WebRTC
//!
//! The media engine consumes encoded samples, so the bridge runs its own
//! pull loop: on every tick of the media clock it takes the generator's
//! latest frame (or a black frame before the first render), stamps it with
//! a 90 kHz presentation timestamp, encodes it and writes the sample to the
//! local track. It never blocks on the generator.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::config::VideoCodec;
use super::signaling::ConnectionState;
use crate::utils::LogThrottler;
use crate::{debug_throttled, warn_throttled};
use crate::video::{BallGenerator, FrameEncoder, PixelFormat, VideoFrame};

/// RTP clock rate for video
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Create RTP codec capability for the H264 sample track
pub fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: VideoCodec::H264.mime_type().to_string(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

/// A frame stamped for the media engine
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub frame: VideoFrame,
    /// Presentation timestamp in `time_base` units
    pub pts: u64,
    /// (numerator, denominator) of the timestamp unit in seconds
    pub time_base: (u32, u32),
}

/// Paces pulls at a fixed frame rate and hands out 90 kHz timestamps
#[derive(Debug)]
pub struct FrameClock {
    increment: u64,
    start: Option<Instant>,
    pts: u64,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        Self {
            increment: (VIDEO_CLOCK_RATE / fps.max(1)) as u64,
            start: None,
            pts: 0,
        }
    }

    /// Wait for the next frame slot and return its timestamp
    ///
    /// The first call returns 0 immediately; later calls advance by one
    /// frame interval and sleep until that point relative to the first call.
    pub async fn next_timestamp(&mut self) -> u64 {
        let Some(start) = self.start else {
            self.start = Some(Instant::now());
            return 0;
        };
        self.pts += self.increment;
        let due = start + Duration::from_secs_f64(self.pts as f64 / VIDEO_CLOCK_RATE as f64);
        tokio::time::sleep_until(due.into()).await;
        self.pts
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.increment as f64 / VIDEO_CLOCK_RATE as f64)
    }
}

/// Pull-based adapter over a [`BallGenerator`]
pub struct BallVideoTrack {
    source: Arc<BallGenerator>,
    clock: FrameClock,
}

impl BallVideoTrack {
    pub fn new(source: Arc<BallGenerator>, fps: u32) -> Self {
        Self {
            source,
            clock: FrameClock::new(fps),
        }
    }

    /// Produce the next frame for the media engine
    pub async fn recv(&mut self) -> MediaFrame {
        let pts = self.clock.next_timestamp().await;
        let frame = self
            .source
            .snapshot_frame()
            .unwrap_or_else(|| VideoFrame::black(self.source.resolution(), PixelFormat::Bgr24));
        MediaFrame {
            frame,
            pts,
            time_base: (1, VIDEO_CLOCK_RATE),
        }
    }

    pub fn frame_duration(&self) -> Duration {
        self.clock.frame_duration()
    }

    /// Spawn the encode-and-write loop
    ///
    /// Samples are only written once the peer reports `connected`, so the
    /// first sample carries the encoder's leading key frame. The loop ends on
    /// cancellation or when the state channel closes.
    pub fn spawn_writer(
        mut self,
        mut encoder: Box<dyn FrameEncoder>,
        sample_track: Arc<TrackLocalStaticSample>,
        mut state_rx: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow();
                if state == ConnectionState::Connected {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            info!("Video track writer started ({})", encoder.name());
            let throttler = LogThrottler::with_secs(5);
            let duration = self.frame_duration();
            let mut samples: u64 = 0;
            let mut write_failing = false;

            loop {
                let media = tokio::select! {
                    _ = cancel.cancelled() => break,
                    media = self.recv() => media,
                };

                let data = match encoder.encode(&media.frame) {
                    Ok(Some(data)) => data,
                    Ok(None) => continue,
                    Err(e) => {
                        debug_throttled!(throttler, "encode", "Failed to encode frame: {}", e);
                        continue;
                    }
                };

                let sample = Sample {
                    data,
                    duration,
                    ..Default::default()
                };
                if let Err(e) = sample_track.write_sample(&sample).await {
                    warn_throttled!(throttler, "write", "Failed to write sample: {}", e);
                    write_failing = true;
                    continue;
                }
                if write_failing {
                    debug!("Sample writes recovered");
                    throttler.clear("write");
                    write_failing = false;
                }
                samples += 1;
                trace!("Wrote sample seq={} pts={}", media.frame.sequence, media.pts);
            }

            info!("Video track writer stopped after {} samples", samples);
        })
    }
}
