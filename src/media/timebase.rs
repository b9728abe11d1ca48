//! Rational time bases and exact timestamp rescaling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A rational number describing the unit of a timestamp.
///
/// A timestamp `ts` in time base `num/den` represents `ts * num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Millisecond time base (1/1000).
    pub const MILLIS: Rational = Rational::new(1, 1000);

    /// MPEG-TS clock (1/90000).
    pub const MPEG_TS: Rational = Rational::new(1, 90_000);

    /// Both terms strictly positive.
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// The reciprocal, e.g. a frame rate turned into a time base.
    pub fn invert(&self) -> Rational {
        Rational::new(self.den, self.num)
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Rescale `ts` from `from` to `to`.
    ///
    /// The product is computed in 128-bit integers and rounded half away from
    /// zero, so there is no floating point drift across repeated calls.
    /// Invalid time bases leave the timestamp unchanged.
    pub fn rescale(ts: i64, from: Rational, to: Rational) -> i64 {
        if from == to || !from.is_valid() || !to.is_valid() {
            return ts;
        }

        let num = ts as i128 * from.num as i128 * to.den as i128;
        let den = from.den as i128 * to.num as i128;
        let half = den / 2;
        let rounded = if num >= 0 {
            (num + half) / den
        } else {
            (num - half) / den
        };

        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::MILLIS
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescale an optional timestamp.
pub fn rescale_opt(ts: Option<i64>, from: Rational, to: Rational) -> Option<i64> {
    ts.map(|t| Rational::rescale(t, from, to))
}
