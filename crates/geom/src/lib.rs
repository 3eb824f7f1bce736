//! Basic geometry of a SCARA plotter: a two-link arm that moves the pen in the
//! plane, plus an independent linear Z axis that lifts it.
//!
//! We call the pivot of the first link the "shoulder," the joint between
//! the two links the "elbow," and the end of the second link the "pen."
//! The shoulder sits at a fixed offset from the origin of the drawing
//! coordinates; everything that talks to the outside world uses drawing
//! coordinates and everything inside the kinematics is relative to the
//! shoulder.

use serde::{Deserialize, Serialize};

mod kinematics;

pub use kinematics::{
    Config, ConfigBuilder, ElbowDirection, Handedness, Translation, Translator, ZeroAngles,
    CROSSOVER_GUARD_DEGREES, SOFT_CLAMP_FACTOR, SOFT_CLAMP_MAX_ITERATIONS,
};

/// Unit tag for drawing coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct World;

pub type Angle = euclid::Angle<f64>;
pub type Point = euclid::Point2D<f64, World>;
pub type Point3 = euclid::Point3D<f64, World>;
pub type Vector = euclid::Vector2D<f64, World>;
pub type Vector3 = euclid::Vector3D<f64, World>;

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("the circles have the same center")]
    CoincidentCenters,
    #[error("circles with radii {r0} and {r1} at distance {distance} don't intersect")]
    NoIntersection { distance: f64, r0: f64, r1: f64 },
    #[error("({x}, {y}) is still out of reach after {iterations} soft-clamp iterations")]
    Unreachable { x: f64, y: f64, iterations: u32 },
    #[error("arc radius {radius} is smaller than half the chord ({half_chord})")]
    RadiusTooSmall { radius: f64, half_chord: f64 },
    #[error("arc has zero radius")]
    DegenerateArc,
    #[error("arc end is {end_radius} from the center, but the start is {radius} from it")]
    EndOffArc { radius: f64, end_radius: f64 },
    #[error("non-finite coordinate")]
    NonFinite,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Absolute step counts of the three motors.
///
/// The arm motors count from the calibrated home pose, so they are zero at
/// the index point. The Z motor counts from z = 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MotorSteps {
    pub arm1: i32,
    pub arm2: i32,
    pub z: i32,
}

impl MotorSteps {
    /// The steps needed to get from `from` to `self`.
    pub fn delta_from(&self, from: &MotorSteps) -> MotorSteps {
        MotorSteps {
            arm1: self.arm1 - from.arm1,
            arm2: self.arm2 - from.arm2,
            z: self.z - from.z,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == MotorSteps::default()
    }
}

pub fn distance(a: Point, b: Point) -> f64 {
    (b.x - a.x).hypot(b.y - a.y)
}

/// The direction from `from` to `to`, measured counter-clockwise from the
/// positive x axis, in the range (-180°, 180°].
pub fn angle_from_x_axis(from: Point, to: Point) -> Angle {
    Angle::radians((to.y - from.y).atan2(to.x - from.x))
}

/// The point at `length` from `origin` in direction `angle`.
pub fn polar(origin: Point, length: f64, angle: Angle) -> Point {
    let (sin, cos) = angle.radians.sin_cos();
    Point::new(origin.x + length * cos, origin.y + length * sin)
}

/// Rounds to a fixed number of decimal places.
pub fn round_to(x: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (x * scale).round() / scale
}

/// Intersects the circle of radius `r0` around `c0` with the circle of radius
/// `r1` around `c1`.
///
/// The first solution lies counter-clockwise of the ray from `c0` to `c1`,
/// the second one clockwise of it. (For tangent circles they coincide.)
/// This means the order depends only on which circle is passed first, which
/// is what lets the kinematics pick a consistent elbow.
pub fn circle_intersection(
    c0: Point,
    r0: f64,
    c1: Point,
    r1: f64,
) -> Result<[Point; 2], GeometryError> {
    let d = distance(c0, c1);
    if !d.is_finite() || !r0.is_finite() || !r1.is_finite() {
        return Err(GeometryError::NonFinite);
    }
    if d == 0.0 {
        return Err(GeometryError::CoincidentCenters);
    }
    if d > r0 + r1 || d < (r0 - r1).abs() {
        return Err(GeometryError::NoIntersection {
            distance: d,
            r0,
            r1,
        });
    }

    // Distance from c0 to the chord joining the two solutions.
    let a = (r0 * r0 - r1 * r1 + d * d) / (2.0 * d);
    // Half the chord length. Rounding can push the square slightly negative
    // for tangent circles.
    let h = (r0 * r0 - a * a).max(0.0).sqrt();

    let dir = (c1 - c0) / d;
    let mid = c0 + dir * a;
    let perp = Vector::new(-dir.y, dir.x) * h;
    Ok([mid + perp, mid - perp])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: Point, b: Point) -> bool {
        distance(a, b) < 1e-9
    }

    #[test]
    fn basic_utilities() {
        let o = Point::new(1.0, 1.0);
        assert!((distance(o, Point::new(4.0, 5.0)) - 5.0).abs() < 1e-12);
        assert!((angle_from_x_axis(o, Point::new(1.0, 2.0)).to_degrees() - 90.0).abs() < 1e-12);
        assert!((angle_from_x_axis(o, Point::new(0.0, 1.0)).to_degrees() - 180.0).abs() < 1e-12);
        assert!(close(polar(o, 2.0, Angle::degrees(-90.0)), Point::new(1.0, -1.0)));
        assert_eq!(round_to(1.23456, 3), 1.235);
    }

    #[test]
    fn intersection_order() {
        let [a, b] =
            circle_intersection(Point::origin(), 5.0, Point::new(8.0, 0.0), 5.0).unwrap();
        assert!(close(a, Point::new(4.0, 3.0)));
        assert!(close(b, Point::new(4.0, -3.0)));

        // Swapping the circles swaps the solutions.
        let [a, b] =
            circle_intersection(Point::new(8.0, 0.0), 5.0, Point::origin(), 5.0).unwrap();
        assert!(close(a, Point::new(4.0, -3.0)));
        assert!(close(b, Point::new(4.0, 3.0)));
    }

    #[test]
    fn intersection_failures() {
        let o = Point::origin();
        assert_eq!(
            circle_intersection(o, 1.0, o, 1.0),
            Err(GeometryError::CoincidentCenters)
        );
        assert!(matches!(
            circle_intersection(o, 1.0, Point::new(3.0, 0.0), 1.0),
            Err(GeometryError::NoIntersection { .. })
        ));
        assert!(matches!(
            circle_intersection(o, 5.0, Point::new(1.0, 0.0), 1.0),
            Err(GeometryError::NoIntersection { .. })
        ));
        assert_eq!(
            circle_intersection(o, 1.0, Point::new(f64::NAN, 0.0), 1.0),
            Err(GeometryError::NonFinite)
        );
    }

    #[test]
    fn tangent_circles() {
        let [a, b] = circle_intersection(Point::origin(), 2.0, Point::new(4.0, 0.0), 2.0).unwrap();
        assert!(close(a, Point::new(2.0, 0.0)));
        assert!(close(a, b));
    }

    proptest! {
        // The solver never hands back NaNs: it either errors or returns points
        // on both circles.
        #[test]
        fn intersections_lie_on_both_circles(
            x0 in -10.0..10.0f64, y0 in -10.0..10.0f64,
            x1 in -10.0..10.0f64, y1 in -10.0..10.0f64,
            r0 in 0.1..10.0f64, r1 in 0.1..10.0f64,
        ) {
            let c0 = Point::new(x0, y0);
            let c1 = Point::new(x1, y1);
            match circle_intersection(c0, r0, c1, r1) {
                Ok(pts) => {
                    for p in pts {
                        prop_assert!(p.x.is_finite() && p.y.is_finite());
                        prop_assert!((distance(p, c0) - r0).abs() < 1e-6);
                        prop_assert!((distance(p, c1) - r1).abs() < 1e-6);
                    }
                }
                Err(GeometryError::NoIntersection { distance: d, .. }) => {
                    prop_assert!(d > r0 + r1 || d < (r0 - r1).abs());
                }
                Err(e) => prop_assert_eq!(e, GeometryError::CoincidentCenters),
            }
        }
    }
}
