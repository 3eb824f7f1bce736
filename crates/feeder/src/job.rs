use std::{path::Path, time::Duration};

use anyhow::Context as _;
use log::debug;
use scara_geom::{Point3, Vector3};
use scara_planner::ArcRequest;
use serde::{Deserialize, Serialize};

use crate::{
    plotter::{MotionSink, Plotter, Speed},
    session::SessionError,
};

/// One drawing command. Coordinates that are left out stay where they are.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JobStep {
    MoveTo {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
    },
    MoveBy {
        #[serde(default)]
        dx: f64,
        #[serde(default)]
        dy: f64,
        #[serde(default)]
        dz: f64,
    },
    ArcTo(ArcRequest),
    ArcBy(ArcRequest),
    PenUp,
    PenDown,
    Speed {
        speed: Speed,
    },
    Pause {
        ms: u64,
    },
    Pace {
        ms: u64,
    },
    Outputs {
        enabled: bool,
    },
    Home,
}

/// A list of drawing commands, run in order on one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub steps: Vec<JobStep>,
}

impl Job {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Job> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("couldn't parse {}", path.display()))
    }

    pub async fn run<S: MotionSink>(&self, plotter: &mut Plotter<S>) -> Result<(), SessionError> {
        for (i, step) in self.steps.iter().enumerate() {
            debug!("step {i}: {step:?}");
            match step {
                JobStep::MoveTo { x, y, z } => {
                    let p = plotter.engine().position();
                    let target = Point3::new(x.unwrap_or(p.x), y.unwrap_or(p.y), z.unwrap_or(p.z));
                    plotter.move_to(target).await?;
                }
                JobStep::MoveBy { dx, dy, dz } => {
                    plotter.move_by(Vector3::new(*dx, *dy, *dz)).await?;
                }
                JobStep::ArcTo(req) => plotter.arc_to(req).await?,
                JobStep::ArcBy(req) => plotter.arc_by(req).await?,
                JobStep::PenUp => plotter.pen_up().await?,
                JobStep::PenDown => plotter.pen_down().await?,
                JobStep::Speed { speed } => plotter.set_speed(*speed),
                JobStep::Pause { ms } => {
                    plotter.pause(Duration::from_millis(*ms));
                }
                JobStep::Pace { ms } => {
                    plotter.pace(Duration::from_millis(*ms));
                }
                JobStep::Outputs { enabled } => plotter.set_outputs(*enabled),
                JobStep::Home => plotter.home().await?,
            }
        }
        Ok(())
    }
}
