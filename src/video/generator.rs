//! Bouncing-ball frame generator
//!
//! A dedicated OS thread renders the ball on a fixed tick, advances its
//! kinematics and publishes the new frame and position together. Readers
//! (the WebRTC track and the session's measurement logic) take copies under
//! a single lock, so they never see a half-updated position or frame.
//!
//! Ticks are drift-corrected: each deadline is the previous deadline plus
//! one interval, and the schedule restarts from "now" when the loop falls
//! more than one interval behind. The sleep waits on a condition variable,
//! so [`BallGenerator::stop`] interrupts it immediately.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::ball::BallState;
use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use super::render::{render_ball, FrameDumper};
use crate::config::VideoConfig;
use crate::error::{AppError, Result};

/// Latest published output
#[derive(Debug)]
struct Latest {
    frame: Option<VideoFrame>,
    position: (i32, i32),
}

#[derive(Debug, Default)]
struct Control {
    started: bool,
    running: bool,
    stop_requested: bool,
    last_error: Option<String>,
}

/// Frame generator shared between the tick thread and its readers
pub struct BallGenerator {
    name: String,
    resolution: Resolution,
    interval: Duration,
    save_frames_dir: Option<std::path::PathBuf>,
    /// Kinematic state, touched only by the tick (or `tick_once`)
    ball: Mutex<BallState>,
    latest: Mutex<Latest>,
    control: Mutex<Control>,
    wake: Condvar,
    sequence: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BallGenerator {
    /// Create a stopped generator
    pub fn new(name: impl Into<String>, config: &VideoConfig) -> Self {
        let ball = BallState::centered(config.width, config.height, config.radius, config.velocity);
        Self {
            name: name.into(),
            resolution: config.resolution(),
            interval: Duration::from_secs_f64(1.0 / config.fps.max(1) as f64),
            save_frames_dir: config.save_frames_dir.clone(),
            latest: Mutex::new(Latest {
                frame: None,
                position: ball.position(),
            }),
            ball: Mutex::new(ball),
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            sequence: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the tick thread (no-op if already started)
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut control = self.control.lock();
            if control.started {
                return Ok(());
            }
            control.started = true;
            control.running = true;
        }

        let generator = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("ball-{}", self.name))
            .spawn(move || generator.run());

        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                info!(
                    "Ball generator {} started ({} @ {:?})",
                    self.name, self.resolution, self.interval
                );
                Ok(())
            }
            Err(e) => {
                let mut control = self.control.lock();
                control.running = false;
                control.last_error = Some(e.to_string());
                Err(AppError::VideoError(format!(
                    "Failed to spawn generator thread: {}",
                    e
                )))
            }
        }
    }

    /// Request the tick loop to exit; idempotent and non-blocking
    pub fn stop(&self) {
        let mut control = self.control.lock();
        if !control.stop_requested {
            debug!("Ball generator {} stop requested", self.name);
        }
        control.stop_requested = true;
        self.wake.notify_all();
    }

    /// Wait up to `timeout` for the tick loop to exit
    ///
    /// Returns `true` once the thread has exited (or was never started).
    /// Blocking; call from a blocking context.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut control = self.control.lock();
            while control.running {
                if self.wake.wait_until(&mut control, deadline).timed_out() {
                    break;
                }
            }
            if control.running {
                warn!(
                    "Ball generator {} did not stop within {:?}",
                    self.name, timeout
                );
                return false;
            }
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Ball generator {} thread panicked", self.name);
            }
        }
        true
    }

    /// Stop and join with a bounded wait
    pub fn stop_and_join(&self, timeout: Duration) -> bool {
        self.stop();
        self.join_timeout(timeout)
    }

    /// Whether the tick loop is currently running
    pub fn is_running(&self) -> bool {
        self.control.lock().running
    }

    /// Error that ended the tick loop, if any
    pub fn last_error(&self) -> Option<String> {
        self.control.lock().last_error.clone()
    }

    /// Latest rendered frame, or `None` before the first tick completes
    pub fn snapshot_frame(&self) -> Option<VideoFrame> {
        self.latest.lock().frame.clone()
    }

    /// Latest committed ball position
    pub fn snapshot_position(&self) -> (i32, i32) {
        self.latest.lock().position
    }

    /// Run a single tick on the calling thread
    pub fn tick_once(&self, dumper: Option<&mut FrameDumper>) -> Result<()> {
        let (data, position) = {
            let mut ball = self.ball.lock();
            let data = render_ball(self.resolution, &ball);
            if let Some(dumper) = dumper {
                dumper.write(self.resolution, &data)?;
            }
            ball.advance();
            (data, ball.position())
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = VideoFrame::from_vec(data, self.resolution, PixelFormat::Bgr24, sequence);

        let mut latest = self.latest.lock();
        latest.frame = Some(frame);
        latest.position = position;
        Ok(())
    }

    fn run(&self) {
        let result = self.tick_loop();

        let mut control = self.control.lock();
        control.running = false;
        match result {
            Ok(()) => info!("Ball generator {} stopped", self.name),
            Err(e) => {
                warn!("Ball generator {} failed: {}", self.name, e);
                control.last_error = Some(e.to_string());
            }
        }
        self.wake.notify_all();
    }

    fn tick_loop(&self) -> Result<()> {
        let mut dumper = match &self.save_frames_dir {
            Some(dir) => Some(FrameDumper::new(dir)?),
            None => None,
        };
        let mut deadline = Instant::now();

        loop {
            if self.control.lock().stop_requested {
                if let Some(dumper) = &dumper {
                    info!(
                        "Ball generator {} saved {} frames",
                        self.name,
                        dumper.frames_written()
                    );
                }
                return Ok(());
            }

            self.tick_once(dumper.as_mut())?;

            deadline += self.interval;
            let now = Instant::now();
            if deadline + self.interval < now {
                debug!("Ball generator {} fell behind, resetting schedule", self.name);
                deadline = now;
            }

            let mut control = self.control.lock();
            while !control.stop_requested {
                if self.wake.wait_until(&mut control, deadline).timed_out() {
                    break;
                }
            }
        }
    }
}
