//! Turns drawing commands into a stream of target points.
//!
//! The [`MotionEngine`] knows where the pen is and what the axis limits are.
//! Asking it for a line or an arc gives back a [`Motion`], an iterator of
//! intermediate points spaced at most the engine's precision apart. The
//! points are only computed as they are taken, so a long move costs nothing
//! up front.

use scara_geom::{round_to, GeometryError, Point3, Vector3};

mod arc;
mod limits;
mod motion;

pub use arc::{ArcCenter, ArcRequest, Rotation};
pub use limits::{Axis, AxisLimits, LimitOverride, Limited, LimitsError};
pub use motion::Motion;

/// The default spacing between consecutive points of a move.
pub const DEFAULT_PRECISION: f64 = 0.01;

/// Positions are rounded to this many decimal places before they're handed out.
pub const POSITION_DECIMALS: i32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
pub enum MotionError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("precision must be positive and finite, got {0}")]
    InvalidPrecision(f64),
}

#[derive(Clone, Debug)]
pub struct MotionEngine {
    position: Point3,
    limits: AxisLimits,
    precision: f64,
}

impl Limited for MotionEngine {
    fn limits_mut(&mut self) -> &mut AxisLimits {
        &mut self.limits
    }
}

impl MotionEngine {
    pub fn new(position: Point3, limits: AxisLimits) -> Self {
        MotionEngine {
            position,
            limits,
            precision: DEFAULT_PRECISION,
        }
    }

    pub fn precision(&self) -> f64 {
        self.precision
    }

    pub fn set_precision(&mut self, precision: f64) -> Result<(), MotionError> {
        if !precision.is_finite() || precision <= 0.0 {
            return Err(MotionError::InvalidPrecision(precision));
        }
        self.precision = precision;
        Ok(())
    }

    pub fn limits(&self) -> &AxisLimits {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: AxisLimits) {
        self.limits = limits;
    }

    /// The current position, exactly as it was last set or corrected.
    pub fn position(&self) -> Point3 {
        self.position
    }

    pub fn rounded_position(&self) -> Point3 {
        Point3::new(
            round_to(self.position.x, POSITION_DECIMALS),
            round_to(self.position.y, POSITION_DECIMALS),
            round_to(self.position.z, POSITION_DECIMALS),
        )
    }

    /// The current position, clamped to the limits and rounded.
    pub fn clamped_position(&self) -> Point3 {
        motion::snap(&self.limits, self.position)
    }

    /// Declares that the pen is at `position`, without moving anything.
    pub fn set_position(&mut self, position: Point3) {
        self.position = position;
    }

    /// A straight line to `target`.
    pub fn move_to(&mut self, target: Point3) -> Motion<'_> {
        let delta = target - self.position;
        self.move_by(delta)
    }

    /// A straight line to the current position plus `delta`.
    pub fn move_by(&mut self, delta: Vector3) -> Motion<'_> {
        let path = motion::Path::Line {
            start: self.position,
            delta,
        };
        Motion::new(&mut self.position, &self.limits, path, self.precision)
    }

    /// An arc, with the end point and center in absolute coordinates.
    pub fn arc_to(&mut self, req: &ArcRequest) -> Result<Motion<'_>, MotionError> {
        match arc::resolve(self.position, req)? {
            Some(path) => Ok(Motion::new(
                &mut self.position,
                &self.limits,
                path,
                self.precision,
            )),
            None => Ok(Motion::empty(&mut self.position, &self.limits)),
        }
    }

    /// An arc, with the end point and center relative to the current position.
    pub fn arc_by(&mut self, req: &ArcRequest) -> Result<Motion<'_>, MotionError> {
        let req = req.relative_to(self.position);
        self.arc_to(&req)
    }
}
