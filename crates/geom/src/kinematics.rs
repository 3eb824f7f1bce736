use serde::{Deserialize, Serialize};

use crate::{
    angle_from_x_axis, circle_intersection, polar, Angle, GeometryError, MotorSteps, Point,
    Point3, Vector,
};

/// Each iteration of the soft clamp shrinks an unreachable target by this factor.
pub const SOFT_CLAMP_FACTOR: f64 = 0.99;

/// Targets still out of reach after this many soft-clamp iterations are an error.
pub const SOFT_CLAMP_MAX_ITERATIONS: u32 = 1000;

/// The first joint's angle is only unwrapped past ±180° when the previous
/// angle was at least this far from zero.
pub const CROSSOVER_GUARD_DEGREES: f64 = 135.0;

/// Which way the arm is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Handedness {
    Left,
    Right,
}

/// Whether the elbow bends away from, or towards, the side given by the
/// arm's handedness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElbowDirection {
    Outward,
    Inward,
}

pub struct ConfigBuilder {
    arm1_len: f64,
    arm2_len: f64,
    origin_offset: Vector,
    steps_per_degree_arm1: f64,
    steps_per_degree_arm2: f64,
    steps_per_unit_z: f64,
    handedness: Handedness,
    elbow_direction: ElbowDirection,
    index_point: Point3,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            arm1_len: 4.0,
            arm2_len: 4.0,
            origin_offset: Vector::new(3.0, 1.25),
            steps_per_degree_arm1: 10.0,
            steps_per_degree_arm2: 10.0,
            steps_per_unit_z: 100.0,
            handedness: Handedness::Left,
            elbow_direction: ElbowDirection::Outward,
            index_point: Point3::new(0.375, 0.5, 15.0),
        }
    }
}

impl ConfigBuilder {
    pub fn build(&self) -> Config {
        Config {
            arm1_len: self.arm1_len,
            arm2_len: self.arm2_len,
            origin_offset: self.origin_offset,
            steps_per_degree_arm1: self.steps_per_degree_arm1,
            steps_per_degree_arm2: self.steps_per_degree_arm2,
            steps_per_unit_z: self.steps_per_unit_z,
            handedness: self.handedness,
            elbow_direction: self.elbow_direction,
            index_point: self.index_point,
        }
    }

    pub fn with_arm_lengths(&mut self, arm1: f64, arm2: f64) -> &mut Self {
        self.arm1_len = arm1;
        self.arm2_len = arm2;
        self
    }

    pub fn with_origin_offset(&mut self, x: f64, y: f64) -> &mut Self {
        self.origin_offset = Vector::new(x, y);
        self
    }

    pub fn with_steps_per_degree(&mut self, arm1: f64, arm2: f64) -> &mut Self {
        self.steps_per_degree_arm1 = arm1;
        self.steps_per_degree_arm2 = arm2;
        self
    }

    pub fn with_steps_per_unit_z(&mut self, steps: f64) -> &mut Self {
        self.steps_per_unit_z = steps;
        self
    }

    pub fn with_handedness(&mut self, handedness: Handedness) -> &mut Self {
        self.handedness = handedness;
        self
    }

    pub fn with_elbow_direction(&mut self, elbow: ElbowDirection) -> &mut Self {
        self.elbow_direction = elbow;
        self
    }

    pub fn with_index_point(&mut self, p: Point3) -> &mut Self {
        self.index_point = p;
        self
    }
}

/// The geometric configuration of a SCARA arm.
///
/// This is plain data; it can't translate anything until it has been
/// calibrated into a [`Translator`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Length of the link from the shoulder to the elbow.
    pub arm1_len: f64,
    /// Length of the link from the elbow to the pen.
    pub arm2_len: f64,
    /// Where the shoulder is, in drawing coordinates.
    pub origin_offset: Vector,
    pub steps_per_degree_arm1: f64,
    pub steps_per_degree_arm2: f64,
    pub steps_per_unit_z: f64,
    pub handedness: Handedness,
    pub elbow_direction: ElbowDirection,
    /// The home pose. The arm motors' step counts are zero here.
    pub index_point: Point3,
}

/// The joint angles of the home pose.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZeroAngles {
    pub arm1: Angle,
    pub arm2: Angle,
}

/// The result of translating a target into motor steps.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Translation {
    pub steps: MotorSteps,
    /// Where the pen really ends up after rounding to whole steps. This, and
    /// not the requested target, is the new position.
    pub position: Point3,
    /// The physical angle of the first joint, which may lie outside
    /// (-180°, 180°]. Feed it back into the next translation.
    pub joint1: Angle,
}

impl Config {
    fn validate(&self) -> Result<(), GeometryError> {
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !positive(self.arm1_len) || !positive(self.arm2_len) {
            return Err(GeometryError::InvalidConfig("arm lengths must be positive"));
        }
        if !positive(self.steps_per_degree_arm1)
            || !positive(self.steps_per_degree_arm2)
            || !positive(self.steps_per_unit_z)
        {
            return Err(GeometryError::InvalidConfig("step ratios must be positive"));
        }
        if !self.origin_offset.x.is_finite()
            || !self.origin_offset.y.is_finite()
            || !self.index_point.x.is_finite()
            || !self.index_point.y.is_finite()
            || !self.index_point.z.is_finite()
        {
            return Err(GeometryError::InvalidConfig("offsets must be finite"));
        }
        Ok(())
    }

    // The circle solver returns the elbow counter-clockwise of the
    // shoulder-to-pen ray first. A left-handed arm with an outward elbow (or
    // a right-handed one with an inward elbow) wants that one.
    fn elbow_index(&self) -> usize {
        match (self.handedness, self.elbow_direction) {
            (Handedness::Left, ElbowDirection::Outward)
            | (Handedness::Right, ElbowDirection::Inward) => 0,
            _ => 1,
        }
    }

    /// Computes the zero angles from the index point and freezes the elbow
    /// choice, producing something that can translate.
    pub fn calibrate(self) -> Result<Translator, GeometryError> {
        self.validate()?;
        let elbow = self.elbow_index();
        let index = self.index_point;
        let rel = Point::new(index.x, index.y) - self.origin_offset;
        let (arm1, arm2) = solve_joints(&self, elbow, rel)?;
        Ok(Translator {
            config: self,
            elbow,
            zero: ZeroAngles { arm1, arm2 },
        })
    }
}

// Shrinks a shoulder-relative target towards the shoulder until it is within
// the arm's reach. Slight overshoot at full extension is normal.
fn soft_clamp(config: &Config, mut p: Point) -> Result<Point, GeometryError> {
    let reach = config.arm1_len + config.arm2_len;
    let mut iterations = 0;
    while p.x.hypot(p.y) > reach {
        if iterations == SOFT_CLAMP_MAX_ITERATIONS {
            return Err(GeometryError::Unreachable {
                x: p.x,
                y: p.y,
                iterations,
            });
        }
        p = Point::new(p.x * SOFT_CLAMP_FACTOR, p.y * SOFT_CLAMP_FACTOR);
        iterations += 1;
    }
    Ok(p)
}

// Returns the first joint's angle in (-180°, 180°] and the second joint's
// angle relative to the first, also in (-180°, 180°].
fn solve_joints(config: &Config, elbow: usize, p: Point) -> Result<(Angle, Angle), GeometryError> {
    if !p.x.is_finite() || !p.y.is_finite() {
        return Err(GeometryError::NonFinite);
    }
    let p = soft_clamp(config, p)?;
    let shoulder = Point::origin();
    let elbows = circle_intersection(shoulder, config.arm1_len, p, config.arm2_len)?;
    let elbow_pos = elbows[elbow];

    let a1 = angle_from_x_axis(shoulder, elbow_pos);
    let a2 = angle_from_x_axis(elbow_pos, p);
    Ok((a1, (a2 - a1).signed()))
}

/// Unwraps the first joint's angle across the ±180° seam.
///
/// `raw` comes from `atan2` and so lies in (-180°, 180°], but the motor turns
/// continuously. If the previous physical angle was out near the seam and
/// the sign flipped, the arm went across the seam rather than all the way
/// around.
pub(crate) fn unwrap_crossover(raw: Angle, last: Angle) -> Angle {
    let raw_deg = raw.to_degrees();
    let last_deg = last.to_degrees();
    if last_deg.abs() >= CROSSOVER_GUARD_DEGREES && (raw_deg < 0.0) != (last_deg < 0.0) {
        Angle::degrees(raw_deg + 360.0 * last_deg.signum())
    } else {
        raw
    }
}

/// A calibrated arm, converting between drawing coordinates and motor steps.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Translator {
    config: Config,
    elbow: usize,
    zero: ZeroAngles,
}

impl Translator {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn zero_angles(&self) -> ZeroAngles {
        self.zero
    }

    /// The translation of the index point: zero steps on both arms.
    pub fn home(&self) -> Result<Translation, GeometryError> {
        self.translate(self.config.index_point, self.zero.arm1)
    }

    /// Converts a target in drawing coordinates into absolute motor steps.
    ///
    /// `last_joint1` is the physical angle of the first joint from the
    /// previous translation (or from [`Translator::home`] at the start of a
    /// session); it is needed to keep that joint continuous across ±180°.
    pub fn translate(&self, target: Point3, last_joint1: Angle) -> Result<Translation, GeometryError> {
        let cfg = &self.config;
        if !target.z.is_finite() {
            return Err(GeometryError::NonFinite);
        }
        let z = (target.z * cfg.steps_per_unit_z).round() as i32;

        let rel = Point::new(target.x, target.y) - cfg.origin_offset;
        let (raw1, a2) = solve_joints(cfg, self.elbow, rel)?;
        let a1 = unwrap_crossover(raw1, last_joint1);

        let steps = MotorSteps {
            arm1: ((a1 - self.zero.arm1).to_degrees() * cfg.steps_per_degree_arm1).round() as i32,
            arm2: ((a2 - self.zero.arm2).to_degrees() * cfg.steps_per_degree_arm2).round() as i32,
            z,
        };

        Ok(Translation {
            steps,
            position: self.steps_to_point(&steps),
            joint1: self.joint1_of(&steps),
        })
    }

    fn joint1_of(&self, steps: &MotorSteps) -> Angle {
        Angle::degrees(
            steps.arm1 as f64 / self.config.steps_per_degree_arm1 + self.zero.arm1.to_degrees(),
        )
    }

    /// Forward kinematics: where the pen is when the motors are at `steps`.
    pub fn steps_to_point(&self, steps: &MotorSteps) -> Point3 {
        let cfg = &self.config;
        let a1 = self.joint1_of(steps);
        let a2 = Angle::degrees(
            steps.arm2 as f64 / cfg.steps_per_degree_arm2 + self.zero.arm2.to_degrees(),
        );
        let elbow = polar(Point::origin(), cfg.arm1_len, a1);
        let pen = polar(elbow, cfg.arm2_len, a1 + a2) + cfg.origin_offset;
        Point3::new(pen.x, pen.y, steps.z as f64 / cfg.steps_per_unit_z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance;
    use proptest::prelude::*;

    fn default_translator() -> Translator {
        ConfigBuilder::default().build().calibrate().unwrap()
    }

    impl Arbitrary for Config {
        type Parameters = ();
        type Strategy = BoxedStrategy<Config>;

        fn arbitrary_with(_: ()) -> Self::Strategy {
            (
                1.0..10.0f64,
                1.0..10.0f64,
                1.0..50.0f64,
                1.0..50.0f64,
                any::<bool>(),
                any::<bool>(),
            )
                .prop_map(|(arm1, arm2, spd1, spd2, left, outward)| {
                    ConfigBuilder::default()
                        .with_arm_lengths(arm1, arm2)
                        .with_steps_per_degree(spd1, spd2)
                        .with_handedness(if left { Handedness::Left } else { Handedness::Right })
                        .with_elbow_direction(if outward {
                            ElbowDirection::Outward
                        } else {
                            ElbowDirection::Inward
                        })
                        // Put the index point comfortably inside the reachable annulus.
                        .with_index_point(Point3::new(
                            3.0 + (arm1 - arm2).abs() + 0.5 * arm1.min(arm2),
                            1.25,
                            0.0,
                        ))
                        .build()
                })
                .boxed()
        }
    }

    // A point in the reachable annulus around the shoulder, in drawing coordinates.
    fn reachable(cfg: &Config, frac: f64, angle_deg: f64) -> Point3 {
        let inner = (cfg.arm1_len - cfg.arm2_len).abs() + 0.05;
        let outer = cfg.arm1_len + cfg.arm2_len - 0.05;
        let r = inner + frac * (outer - inner);
        let p = polar(Point::origin(), r, Angle::degrees(angle_deg)) + cfg.origin_offset;
        Point3::new(p.x, p.y, 1.0)
    }

    #[test]
    fn index_point_is_step_zero() {
        let t = default_translator();
        let home = t.home().unwrap();
        assert_eq!(home.steps.arm1, 0);
        assert_eq!(home.steps.arm2, 0);
        assert_eq!(home.steps.z, 1500);
        let idx = t.config().index_point;
        assert!((home.position.x - idx.x).abs() < 1e-9);
        assert!((home.position.y - idx.y).abs() < 1e-9);
        assert!((home.position.z - idx.z).abs() < 1e-9);
    }

    #[test]
    fn z_is_linear() {
        let t = default_translator();
        let a = t.translate(Point3::new(0.375, -0.25, 15.0), t.zero_angles().arm1).unwrap();
        let b = t.translate(Point3::new(0.375, -0.25, 0.123), a.joint1).unwrap();
        assert_eq!(a.steps.arm1, b.steps.arm1);
        assert_eq!(a.steps.arm2, b.steps.arm2);
        assert_eq!(b.steps.z, 12);
        assert!((b.position.z - 0.12).abs() < 1e-12);
    }

    #[test]
    fn elbow_choice_is_frozen() {
        let left = default_translator();
        let right = ConfigBuilder::default()
            .with_elbow_direction(ElbowDirection::Inward)
            .build()
            .calibrate()
            .unwrap();
        // Both reach the same target, but with the elbow on opposite sides.
        let target = Point3::new(5.0, 4.0, 0.0);
        let l = left.translate(target, left.zero_angles().arm1).unwrap();
        let r = right.translate(target, right.zero_angles().arm1).unwrap();
        assert!(distance(l.position.xy(), r.position.xy()) < 0.05);
        assert_ne!(l.joint1, r.joint1);
    }

    #[test]
    fn soft_clamp_pulls_far_targets_in() {
        let t = default_translator();
        let far = Point3::new(3.0 + 8.5, 1.25, 0.0);
        let res = t.translate(far, t.zero_angles().arm1).unwrap();
        let shoulder = Point::new(3.0, 1.25);
        let r = distance(res.position.xy(), shoulder);
        assert!(r <= 8.0 + 0.01, "radius {r}");
        assert!(r > 8.0 * 0.99 - 0.01, "radius {r}");
    }

    #[test]
    fn soft_clamp_gives_up_eventually() {
        let t = default_translator();
        let res = t.translate(Point3::new(1e9, 1e9, 0.0), t.zero_angles().arm1);
        assert!(matches!(res, Err(GeometryError::Unreachable { iterations, .. }) if iterations == SOFT_CLAMP_MAX_ITERATIONS));
        let res = t.translate(Point3::new(f64::NAN, 0.0, 0.0), t.zero_angles().arm1);
        assert_eq!(res, Err(GeometryError::NonFinite));
    }

    #[test]
    fn shoulder_is_unsolvable_for_equal_arms() {
        let t = default_translator();
        let res = t.translate(Point3::new(3.0, 1.25, 0.0), t.zero_angles().arm1);
        assert_eq!(res, Err(GeometryError::CoincidentCenters));
    }

    #[test]
    fn bad_configs_dont_calibrate() {
        let cfg = ConfigBuilder::default().with_arm_lengths(0.0, 4.0).build();
        assert!(matches!(cfg.calibrate(), Err(GeometryError::InvalidConfig(_))));
        let cfg = ConfigBuilder::default().with_steps_per_unit_z(-1.0).build();
        assert!(matches!(cfg.calibrate(), Err(GeometryError::InvalidConfig(_))));
    }

    #[test]
    fn crossover_keeps_the_joint_continuous() {
        // Sweep the raw angle from 170° up through the seam to -170°.
        let raw: Vec<f64> = (0..=40)
            .map(|i| 170.0 + i as f64 * 0.5)
            .map(|d| if d > 180.0 { d - 360.0 } else { d })
            .collect();

        let mut last = Angle::degrees(raw[0]);
        let mut physical = Vec::new();
        for &d in &raw {
            last = unwrap_crossover(Angle::degrees(d), last);
            physical.push(last.to_degrees());
        }

        assert!(physical.windows(2).all(|w| w[1] > w[0] && w[1] - w[0] < 1.0));
        assert!((physical.last().unwrap() - 190.0).abs() < 1e-9);
        // Without the continuity state there is a jump of nearly 360°.
        assert!(raw.windows(2).any(|w| (w[1] - w[0]).abs() > 300.0));

        // And back down again.
        let mut back = Vec::new();
        for &d in raw.iter().rev() {
            last = unwrap_crossover(Angle::degrees(d), last);
            back.push(last.to_degrees());
        }
        assert!(back.windows(2).all(|w| w[1] < w[0]));
        assert!((back.last().unwrap() - 170.0).abs() < 1e-9);
    }

    #[test]
    fn crossover_ignores_small_angles() {
        // Crossing zero is not a crossover.
        let a = unwrap_crossover(Angle::degrees(1.0), Angle::degrees(-1.0));
        assert_eq!(a.to_degrees(), 1.0);
        // Inside the guard band nothing happens either, even with a sign flip.
        let a = unwrap_crossover(Angle::degrees(-130.0), Angle::degrees(134.0));
        assert!((a.to_degrees() + 130.0).abs() < 1e-9);
    }

    #[test]
    fn crossover_through_translate() {
        // With the shoulder at the origin, sweeping the pen down the line
        // x = -4.6 swings the elbow from about 164° to about 207°, straight
        // through the seam.
        let cfg = ConfigBuilder::default()
            .with_origin_offset(0.0, 0.0)
            .with_index_point(Point3::new(-4.6, 5.0, 0.0))
            .build();
        let t = cfg.calibrate().unwrap();
        let home = t.home().unwrap();
        assert!(home.joint1.to_degrees() > CROSSOVER_GUARD_DEGREES);

        let mut last = home.joint1;
        let mut steps = Vec::new();
        for i in 0..=200 {
            let y = 5.0 - i as f64 * 0.015;
            let tr = t.translate(Point3::new(-4.6, y, 0.0), last).unwrap();
            steps.push(tr.steps.arm1);
            last = tr.joint1;
        }
        assert!(steps.windows(2).all(|w| w[1] >= w[0] && w[1] - w[0] < 50));
        assert!(last.to_degrees() > 180.0);
    }

    proptest! {
        // Translating the corrected position again gives the same steps and
        // the same position.
        #[test]
        fn translation_is_idempotent(cfg: Config, frac in 0.0..1.0f64, angle in -179.0..179.0f64, z in -5.0..20.0f64) {
            let t = cfg.calibrate().unwrap();
            let mut target = reachable(&cfg, frac, angle);
            target.z = z;
            let last = Angle::degrees(angle);
            let first = t.translate(target, last).unwrap();
            let second = t.translate(first.position, last).unwrap();
            prop_assert_eq!(first.steps, second.steps);
            prop_assert!((first.position - second.position).length() < 1e-9);
        }

        // The true position is within half a step of where we asked to go.
        #[test]
        fn translation_is_close(cfg: Config, frac in 0.0..1.0f64, angle in -179.0..179.0f64) {
            let t = cfg.calibrate().unwrap();
            let target = reachable(&cfg, frac, angle);
            let res = t.translate(target, Angle::degrees(angle)).unwrap();
            // Half a step on each joint moves the pen at most this far.
            let slack = (cfg.arm1_len + cfg.arm2_len) * (0.5 / cfg.steps_per_degree_arm1).to_radians()
                + cfg.arm2_len * (0.5 / cfg.steps_per_degree_arm2).to_radians();
            prop_assert!(distance(res.position.xy(), target.xy()) <= slack + 1e-9);
        }
    }
}
