//! The device side of the plotter protocol.
//!
//! An [`Interpreter`] owns the motor pins and serves one session at a time:
//! it reads frames off a [`Link`], pulses step pins at each motor's
//! configured rate, and answers the handshake and keep-alive bytes. It knows
//! nothing about the board it runs on beyond `embedded-hal` output pins, a
//! microsecond [`Clock`], and the link.

#![cfg_attr(not(feature = "std"), no_std)]

mod interpreter;
mod stepper;

#[cfg(feature = "std")]
mod net;

pub use interpreter::Interpreter;
pub use stepper::Stepper;

#[cfg(feature = "std")]
pub use net::StdClock;

/// At most this many motors can be attached, one per motor id.
pub const MAX_MOTORS: usize = scara_protocol::MotorId::MAX as usize;

/// Size of the receive buffer.
pub const BUFFER_LEN: usize = 256;

/// A monotonic microsecond counter.
pub trait Clock {
    fn now_us(&self) -> u64;
}

#[derive(Debug, PartialEq, Eq)]
pub enum LinkError<E> {
    /// The other end went away.
    Closed,
    Io(E),
}

/// A byte stream to the host.
pub trait Link {
    type Error: core::fmt::Debug;

    /// Reads whatever bytes are available, without blocking. `Ok(0)` means
    /// that nothing is available right now.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, LinkError<Self::Error>>;

    /// Writes all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError<Self::Error>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// While a session is open, a still-working byte goes out whenever we
    /// haven't sent anything for this long.
    pub keepalive_us: u64,
    /// If the host sends nothing for this long, the session times out.
    pub idle_timeout_us: u64,
    /// If set, the host has to authenticate with this key before it can move
    /// anything.
    pub auth_key: Option<u64>,
    /// Sent at the start of every session. It must not contain any of the
    /// bytes the host waits for (1, 2, 11 or 12).
    pub banner: &'static [u8],
    /// The initial wait between two steps of the same motor.
    pub step_wait_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            keepalive_us: 500_000,
            idle_timeout_us: 10_000_000,
            auth_key: None,
            banner: b"scara plotter\r\n",
            step_wait_us: 1_000,
        }
    }
}

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The host sent end-of-data, and we acknowledged it.
    EndOfData,
    /// The host went quiet, and we told it so.
    TimedOut,
    /// The host closed the link.
    Disconnected,
    /// The host sent the wrong key.
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum Error<P, L> {
    #[error("GPIO failure: {0:?}")]
    Gpio(P),
    #[error("link failure: {0:?}")]
    Link(L),
}
