use serde::{Deserialize, Serialize};

const MAX_MANTISSA: u64 = 0b1_1111;
const MAX_EXPONENT: u8 = 0b111;

/// The longest wait that fits in one byte: 31 × 10^7 microseconds.
pub const MAX_WAIT_US: u64 = MAX_MANTISSA * 10_000_000;

/// A wait duration squeezed into a single byte.
///
/// The top five bits are a mantissa and the bottom three a decimal exponent,
/// so the byte means `mantissa * 10^exponent` microseconds. Anything up to 31us
/// is exact; above that the encoding is lossy. The widest gap is between
/// `31 * 10^e` and `40 * 10^e`, which puts the relative error at under 12.7%.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wait(u8);

impl Wait {
    /// Encodes a wait, rounding to the nearest representable value. Waits
    /// longer than [`MAX_WAIT_US`] saturate.
    pub fn from_micros(us: u64) -> Wait {
        let mut best = Wait(0);
        let mut best_err = u64::MAX;
        let mut scale = 1u64;
        for exponent in 0..=MAX_EXPONENT {
            let mantissa = (us.saturating_add(scale / 2) / scale).min(MAX_MANTISSA);
            let err = (mantissa * scale).abs_diff(us);
            // On a tie, the smaller exponent wins.
            if err < best_err {
                best = Wait(((mantissa as u8) << 3) | exponent);
                best_err = err;
            }
            scale *= 10;
        }
        best
    }

    pub fn from_byte(b: u8) -> Wait {
        Wait(b)
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    pub fn mantissa(self) -> u8 {
        self.0 >> 3
    }

    pub fn exponent(self) -> u8 {
        self.0 & MAX_EXPONENT
    }

    pub fn as_micros(self) -> u64 {
        u64::from(self.mantissa()) * 10u64.pow(u32::from(self.exponent()))
    }
}
