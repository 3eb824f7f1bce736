use std::time::Duration;

use log::{debug, info};
use scara_geom::{Point3, Translator, Vector3};
use scara_planner::{ArcRequest, Axis, AxisLimits, Limited, Motion, MotionEngine};
use serde::{Deserialize, Serialize};

use crate::session::{Session, SessionConfig, SessionError, StepState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speed {
    Draw,
    Travel,
}

/// Gets told about the plotter's state changes, for example to drive a
/// progress display.
pub trait MotionSink {
    fn on_speed_change(&mut self, _speed: Speed) {}

    fn on_up_down(&mut self, _pen_down: bool) {}
}

pub struct NoopSink;

impl MotionSink for NoopSink {}

/// A connected plotter, taking drawing commands in drawing coordinates.
pub struct Plotter<S = NoopSink> {
    engine: MotionEngine,
    translator: Translator,
    session: Session,
    sink: S,
    pen_down: bool,
    speed: Speed,
}

impl<S> Limited for Plotter<S> {
    fn limits_mut(&mut self) -> &mut AxisLimits {
        self.engine.limits_mut()
    }
}

// Feeds the points of a motion through the translator and into the session,
// correcting the engine's position to wherever the steps really put the pen.
async fn trace(
    mut motion: Motion<'_>,
    translator: &Translator,
    session: &mut Session,
) -> Result<(), SessionError> {
    while let Some(p) = motion.next() {
        let res = match translator.translate(p, session.staged().joint1) {
            Ok(t) => {
                motion.correct(t.position);
                session.stage(&t).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = res {
            // Whatever went wrong, the pen is where the staged steps put it.
            motion.correct(translator.steps_to_point(&session.staged().steps));
            return Err(e);
        }
    }
    Ok(())
}

impl<S: MotionSink> Plotter<S> {
    /// Connects to the device, which must be at its index point.
    pub async fn connect(
        translator: Translator,
        limits: AxisLimits,
        config: SessionConfig,
        sink: S,
    ) -> Result<Plotter<S>, SessionError> {
        let home = translator.home()?;
        let session = Session::open(config, StepState::from(&home)).await?;
        info!("starting at {:?}", home.position);
        Ok(Plotter {
            engine: MotionEngine::new(home.position, limits),
            translator,
            session,
            sink,
            pen_down: false,
            speed: Speed::Draw,
        })
    }

    pub fn position(&self) -> Point3 {
        self.engine.rounded_position()
    }

    pub fn engine(&self) -> &MotionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MotionEngine {
        &mut self.engine
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn is_pen_down(&self) -> bool {
        self.pen_down
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub async fn move_to(&mut self, target: Point3) -> Result<(), SessionError> {
        let motion = self.engine.move_to(target);
        trace(motion, &self.translator, &mut self.session).await
    }

    pub async fn move_by(&mut self, delta: Vector3) -> Result<(), SessionError> {
        let motion = self.engine.move_by(delta);
        trace(motion, &self.translator, &mut self.session).await
    }

    pub async fn arc_to(&mut self, req: &ArcRequest) -> Result<(), SessionError> {
        let motion = self.engine.arc_to(req)?;
        trace(motion, &self.translator, &mut self.session).await
    }

    pub async fn arc_by(&mut self, req: &ArcRequest) -> Result<(), SessionError> {
        let motion = self.engine.arc_by(req)?;
        trace(motion, &self.translator, &mut self.session).await
    }

    async fn move_z(&mut self, z: f64) -> Result<(), SessionError> {
        let p = self.engine.position();
        self.move_to(Point3::new(p.x, p.y, z)).await
    }

    pub async fn pen_up(&mut self) -> Result<(), SessionError> {
        let z = self.session.config().pen_up_z;
        self.move_z(z).await?;
        if self.pen_down {
            self.pen_down = false;
            self.sink.on_up_down(false);
        }
        Ok(())
    }

    pub async fn pen_down(&mut self) -> Result<(), SessionError> {
        let z = self.session.config().pen_down_z;
        self.move_z(z).await?;
        if !self.pen_down {
            self.pen_down = true;
            self.sink.on_up_down(true);
        }
        Ok(())
    }

    pub fn set_speed(&mut self, speed: Speed) {
        if speed == self.speed {
            return;
        }
        let preset = match speed {
            Speed::Draw => self.session.config().draw_speed,
            Speed::Travel => self.session.config().travel_speed,
        };
        self.session.set_speed(preset);
        self.speed = speed;
        self.sink.on_speed_change(speed);
    }

    /// Makes the device pause for a while once it gets here.
    pub fn pause(&mut self, duration: Duration) -> Duration {
        self.session.pause(duration)
    }

    /// Makes the device wait until `duration` has passed since the previous
    /// call, for drawing at a steady pace.
    pub fn pace(&mut self, duration: Duration) -> Duration {
        self.session.pace(duration)
    }

    /// Powers the motor drivers on or off.
    pub fn set_outputs(&mut self, enabled: bool) {
        self.session.set_outputs(enabled);
    }

    /// Goes back to the index point and re-indexes the step counts there.
    ///
    /// The index point may lie outside the limits (it usually sits above the
    /// paper), so they're widened to include it for the trip.
    pub async fn home(&mut self) -> Result<(), SessionError> {
        let index = self.translator.config().index_point;
        {
            let mut plotter = self.override_limits(|limits| {
                for (axis, v) in [(Axis::X, index.x), (Axis::Y, index.y), (Axis::Z, index.z)] {
                    let (min, max) = limits.get(axis);
                    limits.set(axis, min.min(v), max.max(v))?;
                }
                Ok(())
            })?;
            plotter.move_to(index).await?;
        }

        let home = self.translator.home()?;
        self.session.reindex(StepState::from(&home)).await?;
        self.engine.set_position(home.position);
        self.pen_down = false;
        debug!("re-indexed at {:?}", home.position);
        Ok(())
    }

    /// Sends what's left and ends the session, handing back the sink.
    pub async fn finish(self) -> Result<S, SessionError> {
        self.session.finish().await?;
        Ok(self.sink)
    }
}
