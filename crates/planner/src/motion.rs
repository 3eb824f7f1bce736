use scara_geom::{polar, round_to, Angle, Point, Point3, Vector3};

use crate::{limits::AxisLimits, POSITION_DECIMALS};

/// A parametrized path from the start of a move (at `t = 0`) to its end (at
/// `t = 1`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Path {
    Line {
        start: Point3,
        delta: Vector3,
    },
    Arc {
        center: Point,
        radius: f64,
        start_angle: Angle,
        sweep: Angle,
        start_z: f64,
        dz: f64,
        end: Point3,
    },
}

impl Path {
    fn at(&self, t: f64) -> Point3 {
        match *self {
            Path::Line { start, delta } => start + delta * t,
            Path::Arc {
                center,
                radius,
                start_angle,
                sweep,
                start_z,
                dz,
                ..
            } => {
                let p = polar(center, radius, start_angle + sweep * t);
                Point3::new(p.x, p.y, start_z + dz * t)
            }
        }
    }

    fn end(&self) -> Point3 {
        match *self {
            Path::Line { start, delta } => start + delta,
            Path::Arc { end, .. } => end,
        }
    }

    /// How many samples it takes to trace this path at the given precision.
    fn samples(&self, precision: f64) -> u64 {
        let extent = match *self {
            Path::Line { delta, .. } => delta.x.abs().max(delta.y.abs()).max(delta.z.abs()),
            Path::Arc {
                radius, sweep, dz, ..
            } => (sweep.radians.abs() * radius).max(dz.abs()),
        };
        (extent / precision).floor() as u64 + 1
    }
}

pub(crate) fn snap(limits: &AxisLimits, p: Point3) -> Point3 {
    let p = limits.clamp(p);
    Point3::new(
        round_to(p.x, POSITION_DECIMALS),
        round_to(p.y, POSITION_DECIMALS),
        round_to(p.z, POSITION_DECIMALS),
    )
}

/// The points of a single move, produced lazily.
///
/// Every point has been clamped to the axis limits and rounded, and no two
/// consecutive points are the same. The engine's position follows along as
/// points are taken; call [`Motion::correct`] after translating a point to
/// replace it with where the pen really ended up.
///
/// Dropping a motion part way through leaves the engine at the last point
/// that was taken.
#[must_use = "a motion does nothing unless its points are taken"]
pub struct Motion<'a> {
    position: &'a mut Point3,
    limits: &'a AxisLimits,
    path: Path,
    samples: u64,
    next: u64,
    last: Point3,
    finished: bool,
}

impl<'a> Motion<'a> {
    pub(crate) fn new(
        position: &'a mut Point3,
        limits: &'a AxisLimits,
        path: Path,
        precision: f64,
    ) -> Self {
        let last = snap(limits, *position);
        Motion {
            position,
            limits,
            samples: path.samples(precision),
            path,
            next: 1,
            last,
            finished: false,
        }
    }

    /// An empty motion that leaves the position alone.
    pub(crate) fn empty(position: &'a mut Point3, limits: &'a AxisLimits) -> Self {
        let last = snap(limits, *position);
        Motion {
            position,
            limits,
            path: Path::Line {
                start: last,
                delta: Vector3::zero(),
            },
            samples: 0,
            next: 1,
            last,
            finished: true,
        }
    }

    /// Overrides the engine's position with the true reachable position.
    ///
    /// This doesn't affect which points are still to come.
    pub fn correct(&mut self, actual: Point3) {
        *self.position = actual;
    }

    fn emit(&mut self, p: Point3) -> Option<Point3> {
        if p == self.last {
            return None;
        }
        self.last = p;
        *self.position = p;
        Some(p)
    }
}

impl Iterator for Motion<'_> {
    type Item = Point3;

    fn next(&mut self) -> Option<Point3> {
        while self.next <= self.samples {
            let t = self.next as f64 / self.samples as f64;
            self.next += 1;
            let p = snap(self.limits, self.path.at(t));
            if let Some(p) = self.emit(p) {
                return Some(p);
            }
        }

        // Interpolation can drift by a rounding error at the very end, so
        // finish exactly on the requested point.
        if !self.finished {
            self.finished = true;
            let end = snap(self.limits, self.path.end());
            return self.emit(end);
        }
        None
    }
}
