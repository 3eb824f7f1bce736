use embedded_hal::digital::v2::{OutputPin, PinState};
use scara_protocol::Direction;

use crate::Clock;

/// A stepper driver with a step pin and a direction pin.
///
/// Steps are scheduled: each one is due `wait_us` after the previous one
/// was due, not after it actually happened, so time spent elsewhere in the
/// loop doesn't slow the motor down. If we fall more than a whole period
/// behind, the schedule restarts from now instead of trying to catch up.
pub struct Stepper<P> {
    step: P,
    dir: P,
    wait_us: u32,
    next_due_us: u64,
}

impl<P: OutputPin> Stepper<P> {
    pub fn new(step: P, dir: P, wait_us: u32) -> Self {
        Stepper {
            step,
            dir,
            wait_us,
            next_due_us: 0,
        }
    }

    pub fn into_pins(self) -> (P, P) {
        (self.step, self.dir)
    }

    pub fn wait_us(&self) -> u32 {
        self.wait_us
    }

    pub fn set_wait_us(&mut self, wait_us: u32) {
        self.wait_us = wait_us;
    }

    /// When the next step may happen.
    pub fn next_due_us(&self) -> u64 {
        self.next_due_us
    }

    /// Forgets the schedule, so the next step can happen right away.
    pub fn reset_timer(&mut self, now_us: u64) {
        self.next_due_us = now_us;
    }

    pub fn set_direction(&mut self, dir: Direction) -> Result<(), P::Error> {
        self.dir
            .set_state(PinState::from(dir == Direction::Forward))
    }

    /// Pulses the step pin once. The caller is responsible for having waited
    /// until [`Stepper::next_due_us`].
    pub fn pulse(&mut self, clock: &impl Clock) -> Result<(), P::Error> {
        self.step.set_high()?;
        self.step.set_low()?;

        let now = clock.now_us();
        let wait = u64::from(self.wait_us);
        self.next_due_us = if now > self.next_due_us + wait {
            now + wait
        } else {
            self.next_due_us + wait
        };
        Ok(())
    }
}
