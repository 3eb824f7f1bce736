use crate::{Direction, MotorId, StepFrame, MAX_STEPS_PER_FRAME};

/// Splits a signed step delta for one motor into frames of at most 16 steps.
///
/// A delta of `n` steps produces `ceil(|n| / 16)` frames; zero produces none.
pub fn step_frames(motor: MotorId, delta: i32) -> StepFrames {
    StepFrames {
        motor,
        direction: Direction::of(delta),
        remaining: delta.unsigned_abs(),
    }
}

#[derive(Clone, Debug)]
pub struct StepFrames {
    motor: MotorId,
    direction: Direction,
    remaining: u32,
}

impl Iterator for StepFrames {
    type Item = StepFrame;

    fn next(&mut self) -> Option<StepFrame> {
        if self.remaining == 0 {
            return None;
        }
        let block = self.remaining.min(u32::from(MAX_STEPS_PER_FRAME));
        self.remaining -= block;
        StepFrame::new(self.motor, self.direction, block as u8)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.div_ceil(u32::from(MAX_STEPS_PER_FRAME)) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for StepFrames {}

/// Round-robin over several motors' frames, so that a move involving more than
/// one motor doesn't run them one after the other.
pub fn interleave<const N: usize>(parts: [StepFrames; N]) -> Interleaved<N> {
    Interleaved { parts, next: 0 }
}

#[derive(Clone, Debug)]
pub struct Interleaved<const N: usize> {
    parts: [StepFrames; N],
    next: usize,
}

impl<const N: usize> Iterator for Interleaved<N> {
    type Item = StepFrame;

    fn next(&mut self) -> Option<StepFrame> {
        for _ in 0..N {
            let idx = self.next;
            self.next = (self.next + 1) % N;
            if let Some(frame) = self.parts[idx].next() {
                return Some(frame);
            }
        }
        None
    }
}
