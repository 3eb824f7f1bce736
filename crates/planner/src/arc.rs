use scara_geom::{
    angle_from_x_axis, circle_intersection, distance, round_to, Angle, GeometryError, Point,
    Point3, Vector,
};
use serde::{Deserialize, Serialize};

use crate::{motion::Path, POSITION_DECIMALS};

// How far the end of an arc with an explicit center may be off the circle
// through its start.
const END_TOLERANCE: f64 = 2e-3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

impl Rotation {
    /// `+1` is counter-clockwise, `-1` is clockwise.
    pub fn from_sign(sign: i32) -> Option<Rotation> {
        match sign {
            1 => Some(Rotation::CounterClockwise),
            -1 => Some(Rotation::Clockwise),
            _ => None,
        }
    }

    fn signum(self) -> f64 {
        match self {
            Rotation::Clockwise => -1.0,
            Rotation::CounterClockwise => 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArcCenter {
    At(Point),
    /// Only the radius is known, and the center is worked out from the end
    /// points. A positive radius asks for the shorter of the two possible
    /// arcs, a negative one for the longer.
    Radius(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArcRequest {
    pub end: Point3,
    pub center: ArcCenter,
    pub rotation: Rotation,
    /// How many times to go around. Zero is treated like one.
    pub turns: u32,
}

impl ArcRequest {
    pub fn new(end: Point3, center: ArcCenter, rotation: Rotation) -> Self {
        ArcRequest {
            end,
            center,
            rotation,
            turns: 1,
        }
    }

    pub fn with_turns(mut self, turns: u32) -> Self {
        self.turns = turns;
        self
    }

    /// Interprets the end point (and the center, if given) as offsets from `origin`.
    pub(crate) fn relative_to(&self, origin: Point3) -> ArcRequest {
        let center = match self.center {
            ArcCenter::At(c) => ArcCenter::At(origin.xy() + c.to_vector()),
            r @ ArcCenter::Radius(_) => r,
        };
        ArcRequest {
            end: origin + self.end.to_vector(),
            center,
            ..*self
        }
    }
}

fn same_point(a: Point, b: Point) -> bool {
    round_to(a.x, POSITION_DECIMALS) == round_to(b.x, POSITION_DECIMALS)
        && round_to(a.y, POSITION_DECIMALS) == round_to(b.y, POSITION_DECIMALS)
}

fn center_from_radius(
    start: Point,
    end: Point,
    radius: f64,
    rotation: Rotation,
    full: bool,
) -> Result<Point, GeometryError> {
    if !radius.is_finite() {
        return Err(GeometryError::NonFinite);
    }
    if radius == 0.0 {
        return Err(GeometryError::DegenerateArc);
    }
    if full {
        return Ok(start - Vector::new(radius, 0.0));
    }

    let half_chord = distance(start, end) / 2.0;
    let r = radius.abs();
    // A semicircle is fine even if rounding makes the chord a hair too long.
    if r < half_chord * (1.0 - 1e-9) {
        return Err(GeometryError::RadiusTooSmall { radius, half_chord });
    }
    let r = r.max(half_chord);

    // `left` is counter-clockwise of the chord from start to end. Going
    // counter-clockwise around a center on that side is the short way.
    let [left, right] = match circle_intersection(start, r, end, r) {
        Err(GeometryError::NoIntersection { .. }) => {
            return Err(GeometryError::RadiusTooSmall { radius, half_chord })
        }
        res => res?,
    };
    let minor = radius > 0.0;
    Ok(match (rotation, minor) {
        (Rotation::CounterClockwise, true) | (Rotation::Clockwise, false) => left,
        _ => right,
    })
}

/// Works out the path of an arc starting at `start`.
///
/// Returns `None` if the arc doesn't go anywhere.
pub(crate) fn resolve(start: Point3, req: &ArcRequest) -> Result<Option<Path>, GeometryError> {
    let s = start.xy();
    let e = req.end.xy();
    if !e.x.is_finite() || !e.y.is_finite() || !req.end.z.is_finite() {
        return Err(GeometryError::NonFinite);
    }
    let full = same_point(s, e);

    let center = match req.center {
        ArcCenter::At(c) => {
            if !c.x.is_finite() || !c.y.is_finite() {
                return Err(GeometryError::NonFinite);
            }
            c
        }
        ArcCenter::Radius(r) => center_from_radius(s, e, r, req.rotation, full)?,
    };
    let radius = distance(center, s);
    if radius == 0.0 {
        return Err(GeometryError::DegenerateArc);
    }
    let end_radius = distance(center, e);
    if (end_radius - radius).abs() > END_TOLERANCE {
        return Err(GeometryError::EndOffArc { radius, end_radius });
    }

    let start_angle = angle_from_x_axis(center, s);
    let end_angle = angle_from_x_axis(center, e);
    let sign = req.rotation.signum();
    let base = if full {
        360.0
    } else {
        (sign * (end_angle - start_angle).to_degrees()).rem_euclid(360.0)
    };
    let degrees = base + 360.0 * (req.turns.max(1) - 1) as f64;
    let dz = req.end.z - start.z;

    if degrees == 0.0 && dz == 0.0 {
        return Ok(None);
    }
    log::debug!(
        "arc around ({:.3}, {:.3}) with radius {radius:.3}, sweeping {:.1}°",
        center.x,
        center.y,
        sign * degrees
    );

    Ok(Some(Path::Arc {
        center,
        radius,
        start_angle,
        sweep: Angle::degrees(sign * degrees),
        start_z: start.z,
        dz,
        end: req.end,
    }))
}
