use std::{
    convert::Infallible,
    net::{SocketAddr, TcpListener},
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use anyhow::anyhow;
use embedded_hal::digital::v2::OutputPin;
use log::info;
use scara_firmware::{Config, Interpreter, SessionEnd, StdClock};
use scara_geom::{MotorSteps, Point3, Translator};
use svg::{
    node::element::{path::Data, Circle, Path as SvgPath},
    Document,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Step(usize),
    Dir(usize),
    Enable,
}

#[derive(Debug)]
struct SimState {
    steps: MotorSteps,
    forward: [bool; 3],
    enabled: bool,
    // The step counts after every step.
    trace: Vec<MotorSteps>,
}

impl SimState {
    fn axis(&mut self, i: usize) -> Option<&mut i32> {
        match i {
            0 => Some(&mut self.steps.arm1),
            1 => Some(&mut self.steps.arm2),
            2 => Some(&mut self.steps.z),
            _ => None,
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A pin that moves a simulated motor.
///
/// Steps only count while the outputs are enabled.
pub struct SimPin {
    role: Role,
    state: Arc<Mutex<SimState>>,
}

impl SimPin {
    fn set(&mut self, high: bool) {
        let mut state = lock(&self.state);
        match self.role {
            Role::Step(i) => {
                if high && state.enabled {
                    let delta = if state.forward[i] { 1 } else { -1 };
                    if let Some(steps) = state.axis(i) {
                        *steps += delta;
                    }
                    let steps = state.steps;
                    state.trace.push(steps);
                }
            }
            Role::Dir(i) => state.forward[i] = high,
            Role::Enable => state.enabled = !high,
        }
    }
}

impl OutputPin for SimPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.set(true);
        Ok(())
    }
}

/// The device firmware, running on a thread and listening on a local port,
/// with three simulated motors: the two arms, then Z.
pub struct Simulator {
    addr: SocketAddr,
    state: Arc<Mutex<SimState>>,
    thread: Option<JoinHandle<anyhow::Result<Vec<SessionEnd>>>>,
}

impl Simulator {
    /// Starts serving `sessions` sessions, one after the other. The motors
    /// start at `start`.
    pub fn start(config: Config, start: MotorSteps, sessions: usize) -> anyhow::Result<Simulator> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(SimState {
            steps: start,
            forward: [true; 3],
            enabled: false,
            trace: vec![start],
        }));
        let pin = |role| SimPin {
            role,
            state: Arc::clone(&state),
        };

        let mut interpreter = Interpreter::new(config, StdClock::new());
        for i in 0..3 {
            if interpreter
                .add_stepper(pin(Role::Step(i)), pin(Role::Dir(i)))
                .is_err()
            {
                return Err(anyhow!("no room for motor {}", i + 1));
            }
        }
        interpreter.set_enable_pin(pin(Role::Enable));

        let thread = std::thread::spawn(move || {
            let mut ends = Vec::new();
            for _ in 0..sessions {
                let (mut stream, peer) = listener.accept()?;
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                info!("simulator: session from {peer}");
                let end = interpreter
                    .run_session(&mut stream)
                    .map_err(|e| anyhow!("simulated device failed: {e}"))?;
                ends.push(end);
            }
            Ok(ends)
        });
        info!("simulator listening on {addr}");

        Ok(Simulator {
            addr,
            state,
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Where the motors are now.
    pub fn steps(&self) -> MotorSteps {
        lock(&self.state).steps
    }

    pub fn enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    /// Every position the motors have been in, in order.
    pub fn trace(&self) -> Vec<MotorSteps> {
        lock(&self.state).trace.clone()
    }

    /// Waits for all the sessions to end, and says how they did.
    pub fn join(&mut self) -> anyhow::Result<Vec<SessionEnd>> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| anyhow!("the simulator was already joined"))?;
        thread
            .join()
            .map_err(|_| anyhow!("the simulator thread panicked"))?
    }

    /// Draws the path the pen took as an SVG. Parts with the pen above
    /// `pen_z` are drawn lighter.
    pub fn illustrate(
        &self,
        translator: &Translator,
        pen_z: f64,
        out: impl AsRef<Path>,
    ) -> anyhow::Result<()> {
        // Multiply all dimensions by 10 because firefox doesn't like to see small svgs.
        let to_svg = |p: Point3| (p.x * 10.0, -p.y * 10.0);
        let points: Vec<Point3> = self
            .trace()
            .iter()
            .map(|s| translator.steps_to_point(s))
            .collect();

        let mut document = Document::new();
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for p in &points {
            let (x, y) = to_svg(*p);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        // One svg path per run of points with the pen at the same height class.
        let mut runs: Vec<(bool, Vec<Point3>)> = Vec::new();
        for pair in points.windows(2) {
            let down = pair[0].z <= pen_z && pair[1].z <= pen_z;
            match runs.last_mut() {
                Some((d, run)) if *d == down => run.push(pair[1]),
                _ => runs.push((down, vec![pair[0], pair[1]])),
            }
        }
        for (down, run) in runs {
            let mut data = Data::new().move_to(to_svg(run[0]));
            for p in &run[1..] {
                data = data.line_to(to_svg(*p));
            }
            let path = SvgPath::new()
                .set("fill", "none")
                .set("stroke", if down { "black" } else { "lightgray" })
                .set("stroke-width", 1)
                .set("d", data);
            document = document.add(path);
        }

        let index = to_svg(translator.config().index_point);
        document = document.add(
            Circle::new()
                .set("cx", index.0)
                .set("cy", index.1)
                .set("r", 2.0)
                .set("fill", "blue"),
        );

        let margin = 10.0;
        document = document.set(
            "viewBox",
            (
                min_x - margin,
                min_y - margin,
                max_x - min_x + 2.0 * margin,
                max_y - min_y + 2.0 * margin,
            ),
        );
        svg::save(out, &document)?;
        Ok(())
    }
}
