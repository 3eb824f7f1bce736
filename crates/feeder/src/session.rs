use std::time::Duration;

use log::{debug, error, info};
use scara_geom::{Angle, GeometryError, MotorSteps, Translation};
use scara_planner::{LimitsError, MotionError};
use scara_protocol::{code, interleave, step_frames, Control, Frame, MotorId, Wait};
use serde::{Deserialize, Serialize};

use crate::transport::{Transport, TransportError};

const fn motor(id: u8) -> MotorId {
    match MotorId::new(id) {
        Some(m) => m,
        None => panic!("invalid motor id"),
    }
}

pub const ARM1: MotorId = motor(1);
pub const ARM2: MotorId = motor(2);
pub const Z: MotorId = motor(3);

/// Step waits for the three motors, in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeedPreset {
    pub arm_wait_us: u16,
    pub z_wait_us: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub address: String,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// If we haven't sent anything for this long, send a no-op.
    pub keepalive_ms: u64,
    /// Staged bytes are sent once there are at least this many.
    pub batch_size: usize,
    pub auth_key: Option<u64>,
    pub draw_speed: SpeedPreset,
    pub travel_speed: SpeedPreset,
    pub pen_up_z: f64,
    pub pen_down_z: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            address: "127.0.0.1:7070".to_owned(),
            connect_timeout_ms: 5_000,
            send_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            keepalive_ms: 250,
            batch_size: 256,
            auth_key: None,
            draw_speed: SpeedPreset {
                arm_wait_us: 1_500,
                z_wait_us: 1_000,
            },
            travel_speed: SpeedPreset {
                arm_wait_us: 800,
                z_wait_us: 500,
            },
            pen_up_z: 15.0,
            pen_down_z: 0.0,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

/// Where the motors are, as far as the device is concerned.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepState {
    pub steps: MotorSteps,
    /// The first joint's physical angle, needed for the next translation.
    pub joint1: Angle,
}

impl From<&Translation> for StepState {
    fn from(t: &Translation) -> Self {
        StepState {
            steps: t.steps,
            joint1: t.joint1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Motion(#[from] MotionError),
    #[error(transparent)]
    Limits(#[from] LimitsError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("the device timed out waiting for us")]
    DeviceTimeout,
    #[error("only {frames_committed} of {frames} frames were sent")]
    PartialSend {
        frames_committed: usize,
        frames: usize,
        #[source]
        source: TransportError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Effect {
    Control,
    Step { motor: MotorId, delta: i32 },
    // Marks the end of the frames for one target point.
    Point { joint1: Angle },
}

// What happens to the step state once the batch has been sent up to `end`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Staged {
    end: usize,
    effect: Effect,
}

fn steps_of(steps: &mut MotorSteps, motor: MotorId) -> Option<&mut i32> {
    if motor == ARM1 {
        Some(&mut steps.arm1)
    } else if motor == ARM2 {
        Some(&mut steps.arm2)
    } else if motor == Z {
        Some(&mut steps.z)
    } else {
        None
    }
}

// Applies the effects of everything that was completely sent. Returns the
// number of frames that made it, and the number of frames there were.
fn commit(state: &mut StepState, staged: &[Staged], sent: usize) -> (usize, usize) {
    let mut committed = 0;
    let mut frames = 0;
    for s in staged {
        let is_frame = !matches!(s.effect, Effect::Point { .. });
        frames += usize::from(is_frame);
        if s.end > sent {
            continue;
        }
        committed += usize::from(is_frame);
        match s.effect {
            Effect::Control => {}
            Effect::Step { motor, delta } => {
                if let Some(steps) = steps_of(&mut state.steps, motor) {
                    *steps += delta;
                }
            }
            Effect::Point { joint1 } => state.joint1 = joint1,
        }
    }
    (committed, frames)
}

/// One connection to the device, from handshake to end-of-data.
///
/// Frames are staged locally and sent in batches. The session keeps two step
/// states: the staged one, which is where the motors will be once everything
/// staged has been sent, and the committed one, which only counts frames that
/// actually went out.
pub struct Session {
    transport: Transport,
    config: SessionConfig,
    committed: StepState,
    staged: StepState,
    batch: Vec<u8>,
    effects: Vec<Staged>,
    // The head of `batch` is left over from a send that failed, possibly in
    // the middle of a frame. Nothing else may go out before it.
    interrupted: bool,
}

impl Session {
    /// Connects and shakes hands. `start` is where the motors are now.
    pub async fn open(config: SessionConfig, start: StepState) -> Result<Session, SessionError> {
        let mut transport = Transport::connect(&config.address, config.connect_timeout()).await?;

        let banner = transport.drain_incoming()?;
        if !banner.is_empty() {
            info!("device says {:?}", String::from_utf8_lossy(&banner));
        }

        let mut hello = Vec::new();
        if let Some(key) = config.auth_key {
            hello.extend_from_slice(&Frame::from(Control::Auth(key)).to_bytes());
        }
        hello.push(code::READY);
        transport.send(&hello, config.send_timeout()).await?;

        match transport
            .wait_for_any(&[code::READY, code::TIMEOUT], config.handshake_timeout())
            .await
        {
            Ok(code::READY) => {}
            Ok(_) => return Err(SessionError::DeviceTimeout),
            Err(TransportError::Closed) => {
                return Err(SessionError::Handshake("the device hung up".to_owned()))
            }
            Err(TransportError::ReceiveTimeout) => {
                return Err(SessionError::Handshake("no answer to ready-for-data".to_owned()))
            }
            Err(e) => return Err(e.into()),
        }
        info!("connected to {}", config.address);

        let draw_speed = config.draw_speed;
        let mut session = Session {
            transport,
            config,
            committed: start,
            staged: start,
            batch: Vec::new(),
            effects: Vec::new(),
            interrupted: false,
        };
        session.stage_control(Control::EnableOutputs);
        session.set_speed(draw_speed);
        session.flush().await?;
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The step state counting only what has been sent.
    pub fn committed(&self) -> StepState {
        self.committed
    }

    /// The step state counting everything staged.
    pub fn staged(&self) -> StepState {
        self.staged
    }

    fn push(&mut self, frame: Frame, effect: Effect) {
        self.batch.extend_from_slice(&frame.to_bytes());
        self.effects.push(Staged {
            end: self.batch.len(),
            effect,
        });
    }

    pub fn stage_control(&mut self, control: Control) {
        self.push(control.into(), Effect::Control);
    }

    /// Stages the frames that take the motors to `target`.
    pub async fn stage(&mut self, target: &Translation) -> Result<(), SessionError> {
        let delta = target.steps.delta_from(&self.staged.steps);
        let frames = interleave([
            step_frames(ARM1, delta.arm1),
            step_frames(ARM2, delta.arm2),
            step_frames(Z, delta.z),
        ]);
        for f in frames {
            self.push(
                f.into(),
                Effect::Step {
                    motor: f.motor,
                    delta: f.delta(),
                },
            );
        }
        self.effects.push(Staged {
            end: self.batch.len(),
            effect: Effect::Point {
                joint1: target.joint1,
            },
        });
        self.staged = StepState::from(target);

        if self.batch.len() >= self.config.batch_size {
            self.flush().await
        } else {
            self.keep_alive().await
        }
    }

    /// Sends a no-op if the device hasn't heard from us for a while.
    ///
    /// After a failed send this finishes sending the leftovers instead, since
    /// a no-op in the middle of a frame would be read as its argument.
    pub async fn keep_alive(&mut self) -> Result<(), SessionError> {
        if self.interrupted {
            return self.flush().await;
        }
        self.transport
            .keep_alive_if_idle(self.config.keepalive(), self.config.send_timeout())
            .await?;
        Ok(())
    }

    /// Sends everything staged.
    ///
    /// If the send fails part way, the committed state includes exactly the
    /// frames that were sent. The rest stays staged, and the next flush
    /// carries on from the first byte that didn't make it.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        self.check_device()?;
        if self.batch.is_empty() {
            return Ok(());
        }

        let res = self
            .transport
            .send(&self.batch, self.config.send_timeout())
            .await;
        let sent = match &res {
            Ok(()) => self.batch.len(),
            Err(e) => e.bytes_sent().unwrap_or(0),
        };
        let (frames_committed, frames) = commit(&mut self.committed, &self.effects, sent);
        debug!("sent {frames_committed} frames ({sent} bytes)");

        self.batch.drain(..sent);
        self.effects.retain(|s| s.end > sent);
        for s in &mut self.effects {
            s.end -= sent;
        }
        self.interrupted = !self.batch.is_empty();

        match res {
            Ok(()) => Ok(()),
            Err(source) => {
                error!("send failed after {frames_committed} of {frames} frames: {source}");
                Err(SessionError::PartialSend {
                    frames_committed,
                    frames,
                    source,
                })
            }
        }
    }

    // Looks at what the device has sent. Apart from the timeout byte, it's
    // all keep-alives.
    fn check_device(&mut self) -> Result<(), SessionError> {
        let incoming = self.transport.drain_incoming()?;
        if incoming.contains(&code::TIMEOUT) {
            error!("the device timed out");
            return Err(SessionError::DeviceTimeout);
        }
        Ok(())
    }

    pub fn set_speed(&mut self, speed: SpeedPreset) {
        for (motor, wait_us) in [
            (ARM1, speed.arm_wait_us),
            (ARM2, speed.arm_wait_us),
            (Z, speed.z_wait_us),
        ] {
            self.stage_control(Control::SetStepWait { motor, wait_us });
        }
    }

    pub fn set_outputs(&mut self, enabled: bool) {
        self.stage_control(if enabled {
            Control::EnableOutputs
        } else {
            Control::DisableOutputs
        });
    }

    /// Makes the device pause for `duration`, starting from when it gets
    /// there. Returns the pause it will really take, after encoding.
    pub fn pause(&mut self, duration: Duration) -> Duration {
        let wait = Wait::from_micros(duration.as_micros().try_into().unwrap_or(u64::MAX));
        self.stage_control(Control::WaitFor(wait));
        Duration::from_micros(wait.as_micros())
    }

    /// Makes the device wait until `duration` has passed since the end of the
    /// previous such wait. Returns the encoded duration.
    pub fn pace(&mut self, duration: Duration) -> Duration {
        let wait = Wait::from_micros(duration.as_micros().try_into().unwrap_or(u64::MAX));
        self.stage_control(Control::WaitAtLeast(wait));
        Duration::from_micros(wait.as_micros())
    }

    /// Declares that the motors are at `state`, after sending what's staged.
    pub async fn reindex(&mut self, state: StepState) -> Result<(), SessionError> {
        self.flush().await?;
        self.committed = state;
        self.staged = state;
        Ok(())
    }

    /// Sends everything that's left, then ends the session.
    pub async fn finish(mut self) -> Result<(), SessionError> {
        self.flush().await?;
        self.transport
            .send(&[code::END_OF_DATA], self.config.send_timeout())
            .await?;

        let markers = [code::END_OF_DATA, code::TIMEOUT, code::STILL_WORKING];
        loop {
            match self
                .transport
                .wait_for_any(&markers, self.config.handshake_timeout())
                .await?
            {
                code::END_OF_DATA => break,
                code::TIMEOUT => return Err(SessionError::DeviceTimeout),
                _ => debug!("the device is still working"),
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!("error closing the connection: {e}");
        }
        info!("session finished");
        Ok(())
    }
}
