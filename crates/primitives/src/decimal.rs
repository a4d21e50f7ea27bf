//! Fixed-point decimal values: an `i64` unscaled integer plus a base-10
//! scale. This is the storage representation BSI fields use, so arithmetic
//! here has to match the bit-plane arithmetic exactly; a binary float type
//! would not.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A decimal value `unscaled * 10^-scale`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decimal {
    unscaled: i64,
    scale: i16,
}

/// Rescaling or arithmetic left the unscaled value outside `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("decimal value out of range")]
pub struct DecimalOutOfRange;

impl Decimal {
    pub const fn new(unscaled: i64, scale: i16) -> Self {
        Self { unscaled, scale }
    }

    pub const fn unscaled(&self) -> i64 {
        self.unscaled
    }

    pub const fn scale(&self) -> i16 {
        self.scale
    }

    /// Re-expresses `self` with the given scale.
    ///
    /// Scaling up multiplies the unscaled value and can overflow; scaling
    /// down truncates toward zero.
    pub fn with_scale(&self, scale: i16) -> Result<Self, DecimalOutOfRange> {
        let unscaled = match scale.cmp(&self.scale) {
            Ordering::Equal => self.unscaled,
            Ordering::Greater => {
                let factor = pow10((scale - self.scale) as u32).ok_or(DecimalOutOfRange)?;
                self.unscaled.checked_mul(factor).ok_or(DecimalOutOfRange)?
            }
            Ordering::Less => {
                let factor = pow10((self.scale - scale) as u32).ok_or(DecimalOutOfRange)?;
                self.unscaled / factor
            }
        };
        Ok(Self { unscaled, scale })
    }

    /// Checked addition at the coarser operand's precision loss rules: both
    /// operands are first brought to the larger scale.
    pub fn checked_add(&self, rhs: &Decimal) -> Result<Self, DecimalOutOfRange> {
        let scale = self.scale.max(rhs.scale);
        let a = self.with_scale(scale)?;
        let b = rhs.with_scale(scale)?;
        let unscaled = a.unscaled.checked_add(b.unscaled).ok_or(DecimalOutOfRange)?;
        Ok(Self { unscaled, scale })
    }
}

fn pow10(exp: u32) -> Option<i64> {
    10i64.checked_pow(exp)
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_parts(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_parts(other)
    }
}

impl Decimal {
    /// Scale-insensitive comparison. Falls back to widening into `i128` so
    /// comparing e.g. `1.50` with `1.5` never overflows.
    fn cmp_parts(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        let widen = |d: &Decimal| -> i128 {
            (d.unscaled as i128) * 10i128.pow((scale - d.scale) as u32)
        };
        widen(self).cmp(&widen(other))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale <= 0 {
            let shifted = (self.unscaled as i128) * 10i128.pow((-self.scale) as u32);
            return write!(f, "{shifted}");
        }
        let scale = self.scale as u32;
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let mag = (self.unscaled as i128).unsigned_abs();
        let pow = 10u128.pow(scale);
        write!(f, "{sign}{}.{:0width$}", mag / pow, mag % pow, width = scale as usize)
    }
}
