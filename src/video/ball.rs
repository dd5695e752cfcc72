//! Ball kinematics

use serde::{Deserialize, Serialize};

/// Position and velocity of the ball inside a `width` x `height` frame
///
/// Positions are integer pixel coordinates of the ball center. A tick moves
/// the ball by its velocity; an axis whose new coordinate touches or passes
/// `radius` or `dimension - radius` has its velocity negated. There is no
/// sub-tick collision interpolation, so the ball may overshoot a bound by at
/// most one tick's displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallState {
    pub x: i32,
    pub y: i32,
    pub vx: i32,
    pub vy: i32,
    pub radius: i32,
    pub width: i32,
    pub height: i32,
}

impl BallState {
    /// Ball centered in the frame
    pub fn centered(width: u32, height: u32, radius: i32, velocity: (i32, i32)) -> Self {
        Self {
            x: (width / 2) as i32,
            y: (height / 2) as i32,
            vx: velocity.0,
            vy: velocity.1,
            radius,
            width: width as i32,
            height: height as i32,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Advance one tick
    pub fn advance(&mut self) {
        self.x += self.vx;
        self.y += self.vy;
        if self.x <= self.radius || self.x >= self.width - self.radius {
            self.vx = -self.vx;
        }
        if self.y <= self.radius || self.y >= self.height - self.radius {
            self.vy = -self.vy;
        }
    }
}

/// Euclidean distance between the true and a reported position
pub fn measurement_error(truth: (i32, i32), reported: (f64, f64)) -> f64 {
    let dx = truth.0 as f64 - reported.0;
    let dy = truth.1 as f64 - reported.1;
    dx.hypot(dy)
}
