// SPDX-License-Identifier: Apache-2.0

//! Signed Q17.14 fixed-point arithmetic.
//!
//! The BSD-style scheduler keeps `recent_cpu` and `load_avg` as real
//! numbers, but the kernel has no floating point. [`Fixed`] stores such a
//! value as a signed 32-bit integer scaled by `2^14`, giving 17 integer
//! bits, 14 fraction bits and a sign bit.
//!
//! Rounding modes are part of the contract, not an implementation detail:
//! [`Fixed::trunc`] rounds toward zero, [`Fixed::round`] rounds half away
//! from zero. Products and quotients of two fixed-point values go through a
//! 64-bit intermediate so the scale correction cannot overflow; final
//! results are expected to fit back into 32 bits.
//!
//! A dedicated type (rather than bare `i32`) keeps scaled and unscaled
//! integers from mixing: `Fixed + i32` scales the integer, `Fixed * i32`
//! does not, exactly as the arithmetic requires.
//!
//! # Examples
//!
//! ```
//! use kfixed::Fixed;
//!
//! let load = Fixed::from_int(59) / 60;
//! assert_eq!((load * 60).round(), 59);
//! assert_eq!(Fixed::from_int(-3).raw() / 2, (Fixed::from_int(-3) / 2).raw());
//! ```

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::ops::{Add, Div, Mul, Sub};

/// Number of fraction bits.
pub const Q: u32 = 14;

/// The scale factor `2^Q`.
const F: i32 = 1 << Q;

/// A signed Q17.14 fixed-point number.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(i32);

impl Fixed {
    /// The value `0`.
    pub const ZERO: Fixed = Fixed(0);

    /// Converts an integer to fixed point.
    #[inline]
    pub const fn from_int(n: i32) -> Self {
        Fixed(n * F)
    }

    /// Builds a value from its raw scaled representation.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Fixed(raw)
    }

    /// Returns the raw scaled representation.
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Converts to integer, rounding toward zero.
    #[inline]
    pub const fn trunc(self) -> i32 {
        self.0 / F
    }

    /// Converts to integer, rounding half away from zero.
    #[inline]
    pub const fn round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }
}

impl Add for Fixed {
    type Output = Fixed;

    #[inline]
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    #[inline]
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}

impl Add<i32> for Fixed {
    type Output = Fixed;

    #[inline]
    fn add(self, rhs: i32) -> Fixed {
        Fixed(self.0 + rhs * F)
    }
}

impl Sub<i32> for Fixed {
    type Output = Fixed;

    #[inline]
    fn sub(self, rhs: i32) -> Fixed {
        Fixed(self.0 - rhs * F)
    }
}

impl Mul for Fixed {
    type Output = Fixed;

    /// `Fixed * Fixed` carries one extra scale factor, removed through a
    /// 64-bit intermediate.
    #[inline]
    fn mul(self, rhs: Fixed) -> Fixed {
        Fixed((self.0 as i64 * rhs.0 as i64 / F as i64) as i32)
    }
}

impl Mul<i32> for Fixed {
    type Output = Fixed;

    #[inline]
    fn mul(self, rhs: i32) -> Fixed {
        Fixed(self.0 * rhs)
    }
}

impl Div for Fixed {
    type Output = Fixed;

    /// `Fixed / Fixed` loses one scale factor, restored before the division
    /// through a 64-bit intermediate.
    #[inline]
    fn div(self, rhs: Fixed) -> Fixed {
        Fixed((self.0 as i64 * F as i64 / rhs.0 as i64) as i32)
    }
}

impl Div<i32> for Fixed {
    type Output = Fixed;

    #[inline]
    fn div(self, rhs: i32) -> Fixed {
        Fixed(self.0 / rhs)
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fixed({}/{})", self.0, F)
    }
}

impl fmt::Display for Fixed {
    /// Prints with two decimal places, which is all the scheduler reports.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hundredths = (*self * 100).round();
        let sign = if hundredths < 0 { "-" } else { "" };
        write!(
            f,
            "{}{}.{:02}",
            sign,
            (hundredths / 100).abs(),
            (hundredths % 100).abs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_round_trip() {
        for n in [-70, -1, 0, 1, 31, 63, 100] {
            assert_eq!(Fixed::from_int(n).trunc(), n);
            assert_eq!(Fixed::from_int(n).round(), n);
        }
    }

    #[test]
    fn trunc_rounds_toward_zero() {
        let three_halves = Fixed::from_int(3) / 2;
        assert_eq!(three_halves.trunc(), 1);
        assert_eq!((Fixed::ZERO - three_halves).trunc(), -1);
        // 99/100 truncates to zero from both sides.
        assert_eq!((Fixed::from_int(99) / 100).trunc(), 0);
        assert_eq!((Fixed::from_int(-99) / 100).trunc(), 0);
    }

    #[test]
    fn round_is_half_away_from_zero() {
        let half = Fixed::from_raw(F / 2);
        assert_eq!(half.round(), 1);
        assert_eq!(Fixed::from_raw(-F / 2).round(), -1);
        assert_eq!(Fixed::from_raw(F / 2 - 1).round(), 0);
        assert_eq!(Fixed::from_raw(-(F / 2) + 1).round(), 0);
    }

    #[test]
    fn mixed_addition_scales_the_integer() {
        let x = Fixed::from_int(2) + 3;
        assert_eq!(x.trunc(), 5);
        assert_eq!((x - 5).raw(), 0);
    }

    #[test]
    fn fixed_multiplication_uses_wide_intermediate() {
        // 300 * 300 = 90000 fits the value range, but the raw product
        // 300F * 300F overflows 32 bits long before the rescale.
        let x = Fixed::from_int(300);
        assert_eq!((x * x).trunc(), 90_000);
    }

    #[test]
    fn fixed_division_uses_wide_intermediate() {
        // (1/60) reconstructed by division of two fixed values.
        let one = Fixed::from_int(1);
        let sixty = Fixed::from_int(60);
        let q = one / sixty;
        assert_eq!((q * 60).round(), 1);
        // 100000 / 3 needs the widened numerator.
        let big = Fixed::from_int(100_000);
        assert_eq!((big / Fixed::from_int(3)).round(), 33_333);
    }

    #[test]
    fn decay_coefficient_is_less_than_one() {
        // 2L / (2L + 1) for a few loads; always in (0, 1).
        for load in 1..10 {
            let twice = Fixed::from_int(load) * 2;
            let c = twice / (twice + 1);
            assert!(c > Fixed::ZERO);
            assert!(c < Fixed::from_int(1));
        }
    }

    #[test]
    fn display_has_two_decimals() {
        assert_eq!((Fixed::from_int(59) / 60).to_string(), "0.98");
        assert_eq!(Fixed::from_int(-2).to_string(), "-2.00");
    }
}
