//! The byte protocol spoken between the feeder and the stepper controller.
//!
//! Every byte on the wire is either a motor-step frame (values 32 to 255) or
//! the start of a control frame (values 0 to 31). Control frames may carry a
//! fixed number of argument bytes, and the receiver must not dispatch one
//! until all of its arguments have arrived.

#![cfg_attr(not(feature = "std"), no_std)]

use serde::{Deserialize, Serialize};

mod steps;
mod wait;

pub use steps::{interleave, step_frames, Interleaved, StepFrames};
pub use wait::{Wait, MAX_WAIT_US};

/// Control codes. Everything below 32 is reserved for these.
pub mod code {
    pub const NOOP: u8 = 0;
    pub const READY: u8 = 1;
    pub const END_OF_DATA: u8 = 2;
    pub const IDLE: u8 = 10;
    pub const STILL_WORKING: u8 = 11;
    pub const TIMEOUT: u8 = 12;
    pub const DISABLE_OUTPUTS: u8 = 13;
    pub const ENABLE_OUTPUTS: u8 = 14;
    pub const AUTH: u8 = 21;
    pub const SET_STEP_WAIT: u8 = 22;
    pub const WAIT_AT_LEAST: u8 = 28;
    pub const WAIT_FOR: u8 = 29;

    /// The first byte value that is a motor-step frame.
    pub const FIRST_STEP_BYTE: u8 = 32;
}

/// The longest frame on the wire: the auth code plus an eight byte key.
pub const MAX_FRAME_LEN: usize = 9;

/// The most physical steps a single motor frame can carry.
pub const MAX_STEPS_PER_FRAME: u8 = 16;

pub type FrameBytes = heapless::Vec<u8, MAX_FRAME_LEN>;

/// A motor address. Zero is never a motor, because a zero in the top three
/// bits would collide with the control space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MotorId(u8);

impl MotorId {
    pub const MAX: u8 = 7;

    pub const fn new(id: u8) -> Option<MotorId> {
        if id >= 1 && id <= Self::MAX {
            Some(MotorId(id))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Zero-based index, handy for per-motor tables.
    pub const fn index(self) -> usize {
        self.0 as usize - 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Steps that increase the motor's step count. Encoded as a set direction bit.
    Forward,
    Backward,
}

impl Direction {
    pub fn of(delta: i32) -> Direction {
        if delta >= 0 {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    pub fn signum(self) -> i32 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// One motor-step frame: between 1 and 16 steps of a single motor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFrame {
    pub motor: MotorId,
    pub direction: Direction,
    steps: u8,
}

impl StepFrame {
    pub fn new(motor: MotorId, direction: Direction, steps: u8) -> Option<StepFrame> {
        (1..=MAX_STEPS_PER_FRAME)
            .contains(&steps)
            .then_some(StepFrame {
                motor,
                direction,
                steps,
            })
    }

    /// The number of physical steps, always at least one.
    pub fn steps(&self) -> u8 {
        self.steps
    }

    /// The signed change in step count that this frame causes.
    pub fn delta(&self) -> i32 {
        self.direction.signum() * i32::from(self.steps)
    }

    pub fn to_byte(&self) -> u8 {
        let dir = match self.direction {
            Direction::Forward => 1,
            Direction::Backward => 0,
        };
        (self.motor.get() << 5) | (dir << 4) | (self.steps - 1)
    }

    /// Decodes a motor frame byte. Returns `None` for bytes in the control space.
    pub fn from_byte(byte: u8) -> Option<StepFrame> {
        let motor = MotorId::new((byte & 0b1110_0000) >> 5)?;
        let direction = if byte & 0b0001_0000 != 0 {
            Direction::Forward
        } else {
            Direction::Backward
        };
        Some(StepFrame {
            motor,
            direction,
            steps: (byte & 0b0000_1111) + 1,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Control {
    /// Either of the two no-op codes.
    Noop,
    Ready,
    EndOfData,
    StillWorking,
    Timeout,
    DisableOutputs,
    EnableOutputs,
    Auth(u64),
    SetStepWait { motor: MotorId, wait_us: u16 },
    WaitAtLeast(Wait),
    WaitFor(Wait),
    /// A code in the control space that we don't know. Receivers treat it as a
    /// single-byte no-op so that new codes can be added later.
    Unknown(u8),
}

impl Control {
    /// How many argument bytes follow a control code.
    pub fn arg_len(code: u8) -> usize {
        match code {
            code::AUTH => 8,
            code::SET_STEP_WAIT => 3,
            code::WAIT_AT_LEAST | code::WAIT_FOR => 1,
            _ => 0,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Control::Noop => code::NOOP,
            Control::Ready => code::READY,
            Control::EndOfData => code::END_OF_DATA,
            Control::StillWorking => code::STILL_WORKING,
            Control::Timeout => code::TIMEOUT,
            Control::DisableOutputs => code::DISABLE_OUTPUTS,
            Control::EnableOutputs => code::ENABLE_OUTPUTS,
            Control::Auth(_) => code::AUTH,
            Control::SetStepWait { .. } => code::SET_STEP_WAIT,
            Control::WaitAtLeast(_) => code::WAIT_AT_LEAST,
            Control::WaitFor(_) => code::WAIT_FOR,
            Control::Unknown(c) => *c,
        }
    }

    // `args` must have exactly `arg_len(code)` bytes.
    fn from_parts(code: u8, args: &[u8]) -> Control {
        match code {
            code::NOOP | code::IDLE => Control::Noop,
            code::READY => Control::Ready,
            code::END_OF_DATA => Control::EndOfData,
            code::STILL_WORKING => Control::StillWorking,
            code::TIMEOUT => Control::Timeout,
            code::DISABLE_OUTPUTS => Control::DisableOutputs,
            code::ENABLE_OUTPUTS => Control::EnableOutputs,
            code::AUTH => {
                let mut key = [0u8; 8];
                key.copy_from_slice(args);
                Control::Auth(u64::from_be_bytes(key))
            }
            code::SET_STEP_WAIT => match MotorId::new(args[0]) {
                Some(motor) => Control::SetStepWait {
                    motor,
                    wait_us: u16::from_be_bytes([args[1], args[2]]),
                },
                None => Control::Unknown(code),
            },
            code::WAIT_AT_LEAST => Control::WaitAtLeast(Wait::from_byte(args[0])),
            code::WAIT_FOR => Control::WaitFor(Wait::from_byte(args[0])),
            other => Control::Unknown(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Step(StepFrame),
    Control(Control),
}

impl Frame {
    /// Tries to parse one frame from the start of `buf`.
    ///
    /// Returns the frame together with the number of bytes it used, or `None`
    /// if `buf` doesn't yet hold a complete frame. In the `None` case nothing
    /// should be consumed: the missing bytes are still on their way.
    pub fn parse(buf: &[u8]) -> Option<(Frame, usize)> {
        let &first = buf.first()?;
        if let Some(step) = StepFrame::from_byte(first) {
            return Some((Frame::Step(step), 1));
        }

        let len = 1 + Control::arg_len(first);
        if buf.len() < len {
            return None;
        }
        Some((Frame::Control(Control::from_parts(first, &buf[1..len])), len))
    }

    pub fn to_bytes(&self) -> FrameBytes {
        let mut ret = FrameBytes::new();
        // None of these can overflow MAX_FRAME_LEN.
        match self {
            Frame::Step(s) => {
                let _ = ret.push(s.to_byte());
            }
            Frame::Control(c) => {
                let _ = ret.push(c.code());
                let _ = match c {
                    Control::Auth(key) => ret.extend_from_slice(&key.to_be_bytes()),
                    Control::SetStepWait { motor, wait_us } => {
                        let [hi, lo] = wait_us.to_be_bytes();
                        ret.extend_from_slice(&[motor.get(), hi, lo])
                    }
                    Control::WaitAtLeast(w) | Control::WaitFor(w) => ret.push(w.to_byte()).map_err(|_| ()),
                    _ => Ok(()),
                };
            }
        }
        ret
    }
}

impl From<StepFrame> for Frame {
    fn from(s: StepFrame) -> Frame {
        Frame::Step(s)
    }
}

impl From<Control> for Frame {
    fn from(c: Control) -> Frame {
        Frame::Control(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn motor(id: u8) -> MotorId {
        MotorId::new(id).unwrap()
    }

    #[test]
    fn motor_bytes_never_hit_the_control_space() {
        for id in 1..=7 {
            for dir in [Direction::Forward, Direction::Backward] {
                for steps in 1..=16 {
                    let b = StepFrame::new(motor(id), dir, steps).unwrap().to_byte();
                    assert!(b >= code::FIRST_STEP_BYTE);
                }
            }
        }
        assert_eq!(MotorId::new(0), None);
        assert_eq!(MotorId::new(8), None);
    }

    #[test]
    fn motor_byte_layout() {
        // motor 3, forward, 16 steps
        let b = StepFrame::new(motor(3), Direction::Forward, 16).unwrap().to_byte();
        assert_eq!(b, 0b0111_1111);
        // motor 1, backward, 1 step
        let b = StepFrame::new(motor(1), Direction::Backward, 1).unwrap().to_byte();
        assert_eq!(b, 0b0010_0000);
        assert_eq!(StepFrame::new(motor(1), Direction::Backward, 0), None);
        assert_eq!(StepFrame::new(motor(1), Direction::Backward, 17), None);
    }

    #[test]
    fn partial_control_frames_are_incomplete() {
        let bytes = Frame::from(Control::SetStepWait {
            motor: motor(2),
            wait_us: 0x1234,
        })
        .to_bytes();
        assert_eq!(bytes.as_slice(), &[code::SET_STEP_WAIT, 2, 0x12, 0x34]);
        for len in 0..bytes.len() {
            assert_eq!(Frame::parse(&bytes[..len]), None);
        }
        let (frame, used) = Frame::parse(&bytes).unwrap();
        assert_eq!(used, 4);
        assert_eq!(
            frame,
            Frame::Control(Control::SetStepWait {
                motor: motor(2),
                wait_us: 0x1234
            })
        );
    }

    #[test]
    fn auth_key_is_big_endian() {
        let bytes = Frame::from(Control::Auth(0x0102_0304_0506_0708)).to_bytes();
        assert_eq!(bytes.as_slice(), &[21, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn unknown_codes_are_single_bytes() {
        assert_eq!(
            Frame::parse(&[5, 0xff]),
            Some((Frame::Control(Control::Unknown(5)), 1))
        );
        assert_eq!(Frame::parse(&[10]), Some((Frame::Control(Control::Noop), 1)));
    }

    proptest! {
        #[test]
        fn parse_never_reads_past_its_frame(bytes in proptest::collection::vec(any::<u8>(), 0..32)) {
            let mut rest = bytes.as_slice();
            while let Some((frame, used)) = Frame::parse(rest) {
                prop_assert!(used >= 1 && used <= rest.len());
                if let Frame::Step(s) = frame {
                    prop_assert_eq!(s.to_byte(), rest[0]);
                }
                rest = &rest[used..];
            }
            // Whatever is left must be the beginning of a control frame.
            if let Some(&first) = rest.first() {
                prop_assert!(first < code::FIRST_STEP_BYTE);
                prop_assert!(rest.len() < 1 + Control::arg_len(first));
            }
        }
    }
}
