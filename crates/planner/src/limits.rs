use std::ops::{Deref, DerefMut};

use scara_geom::Point3;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
pub enum LimitsError {
    #[error("{axis:?} limits are inverted: min {min} > max {max}")]
    Inverted { axis: Axis, min: f64, max: f64 },
    #[error("{axis:?} limits must be finite, got [{min}, {max}]")]
    NonFinite { axis: Axis, min: f64, max: f64 },
}

/// The travel limits of the three axes.
///
/// Every constructor and setter checks that `min <= max` on each axis, so
/// there is no way to get hold of an inverted box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLimits", into = "RawLimits")]
pub struct AxisLimits {
    x: (f64, f64),
    y: (f64, f64),
    z: (f64, f64),
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct RawLimits {
    minx: f64,
    maxx: f64,
    miny: f64,
    maxy: f64,
    minz: f64,
    maxz: f64,
}

impl TryFrom<RawLimits> for AxisLimits {
    type Error = LimitsError;

    fn try_from(r: RawLimits) -> Result<Self, LimitsError> {
        AxisLimits::new((r.minx, r.maxx), (r.miny, r.maxy), (r.minz, r.maxz))
    }
}

impl From<AxisLimits> for RawLimits {
    fn from(l: AxisLimits) -> Self {
        RawLimits {
            minx: l.x.0,
            maxx: l.x.1,
            miny: l.y.0,
            maxy: l.y.1,
            minz: l.z.0,
            maxz: l.z.1,
        }
    }
}

fn check(axis: Axis, (min, max): (f64, f64)) -> Result<(f64, f64), LimitsError> {
    if !min.is_finite() || !max.is_finite() {
        Err(LimitsError::NonFinite { axis, min, max })
    } else if min > max {
        Err(LimitsError::Inverted { axis, min, max })
    } else {
        Ok((min, max))
    }
}

impl Default for AxisLimits {
    /// A box around everything the default arm can reach, with the pen
    /// anywhere between the bed and 20 units up.
    fn default() -> Self {
        AxisLimits {
            x: (-5.0, 11.0),
            y: (-6.75, 9.25),
            z: (0.0, 20.0),
        }
    }
}

impl AxisLimits {
    /// Each argument is a `(min, max)` pair.
    pub fn new(x: (f64, f64), y: (f64, f64), z: (f64, f64)) -> Result<Self, LimitsError> {
        Ok(AxisLimits {
            x: check(Axis::X, x)?,
            y: check(Axis::Y, y)?,
            z: check(Axis::Z, z)?,
        })
    }

    pub fn get(&self, axis: Axis) -> (f64, f64) {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Changes one axis. On error, nothing changes.
    pub fn set(&mut self, axis: Axis, min: f64, max: f64) -> Result<(), LimitsError> {
        let range = check(axis, (min, max))?;
        match axis {
            Axis::X => self.x = range,
            Axis::Y => self.y = range,
            Axis::Z => self.z = range,
        }
        Ok(())
    }

    pub fn contains(&self, p: Point3) -> bool {
        self.clamp(p) == p
    }

    pub fn clamp(&self, p: Point3) -> Point3 {
        Point3::new(
            p.x.clamp(self.x.0, self.x.1),
            p.y.clamp(self.y.0, self.y.1),
            p.z.clamp(self.z.0, self.z.1),
        )
    }
}

/// Something that moves within axis limits.
pub trait Limited {
    fn limits_mut(&mut self) -> &mut AxisLimits;

    /// Temporarily changes the limits.
    ///
    /// `f` edits a copy of the current limits; if it fails, nothing changes.
    /// Otherwise the new limits stay in force until the returned guard is
    /// dropped, and the guard derefs to `self` in the meantime.
    fn override_limits<F>(&mut self, f: F) -> Result<LimitOverride<'_, Self>, LimitsError>
    where
        Self: Sized,
        F: FnOnce(&mut AxisLimits) -> Result<(), LimitsError>,
    {
        let saved = *self.limits_mut();
        let mut limits = saved;
        f(&mut limits)?;
        *self.limits_mut() = limits;
        Ok(LimitOverride { inner: self, saved })
    }
}

/// Restores the overridden limits when dropped.
pub struct LimitOverride<'a, T: Limited> {
    inner: &'a mut T,
    saved: AxisLimits,
}

impl<T: Limited> Deref for LimitOverride<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
    }
}

impl<T: Limited> DerefMut for LimitOverride<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner
    }
}

impl<T: Limited> Drop for LimitOverride<'_, T> {
    fn drop(&mut self) {
        *self.inner.limits_mut() = self.saved;
    }
}
