//! The host side of the plotter: turns drawing commands into step frames and
//! feeds them to the device over TCP.
//!
//! A [`Plotter`] ties together the motion engine, the kinematics and a
//! [`Session`] with the device. The session stages frames in batches, keeps
//! the connection alive, and only counts steps as done once their frames
//! have actually gone out. The [`Simulator`] runs the real firmware against
//! simulated motors, for tests and dry runs.

pub mod config;
pub mod job;
pub mod plotter;
pub mod session;
pub mod simulator;
pub mod transport;

pub use config::FeederConfig;
pub use job::{Job, JobStep};
pub use plotter::{MotionSink, NoopSink, Plotter, Speed};
pub use session::{Session, SessionConfig, SessionError, SpeedPreset, StepState};
pub use simulator::Simulator;
pub use transport::{Transport, TransportError};
