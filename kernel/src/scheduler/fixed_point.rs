//! Fixed-point arithmetic for the MLFQS calculator.
//!
//! Signed P.Q representation: P = 17 integer bits, Q = 14 fraction bits,
//! one sign bit, encoding factor F = 2^Q. Products and quotients widen to
//! i64 around the scale correction so intermediates cannot overflow the
//! 31 usable bits. All operations are pure and reproduce bit-for-bit.

use core::ops::{Add, Sub};

/// Integer bits.
pub const P: u32 = 17;
/// Fraction bits.
pub const Q: u32 = 14;
/// Encoding factor, F = 2^Q.
const F: i32 = 1 << Q;

/// A signed 17.14 fixed-point value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    /// Converts an integer; exact within the P-bit range. Keeping the
    /// operand in range is the caller's obligation.
    pub const fn from_int(n: i32) -> Fixed {
        Fixed(n * F)
    }

    pub const fn from_raw(raw: i32) -> Fixed {
        Fixed(raw)
    }

    /// Raw representation, for tests and diagnostics.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Converts to integer, truncating toward zero.
    pub const fn to_int_trunc(self) -> i32 {
        self.0 / F
    }

    /// Converts to integer, rounding to nearest; ties resolve away from
    /// zero.
    pub const fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    pub const fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n * F)
    }

    pub const fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n * F)
    }

    /// Scales by an integer factor; no F correction needed.
    pub const fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    /// Divides by an integer divisor, truncating.
    pub const fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }

    /// Fixed × fixed, widened to i64 before the scale correction.
    pub const fn mul(self, rhs: Fixed) -> Fixed {
        Fixed((self.0 as i64 * rhs.0 as i64 / F as i64) as i32)
    }

    /// Fixed ÷ fixed; the dividend is pre-scaled by F in i64 so the
    /// fractional precision survives the integer division.
    pub const fn div(self, rhs: Fixed) -> Fixed {
        Fixed((self.0 as i64 * F as i64 / rhs.0 as i64) as i32)
    }
}

impl Add for Fixed {
    type Output = Fixed;

    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Fixed;

    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn integer_conversions_are_exact() {
        assert_eq!(Fixed::from_int(0).raw(), 0);
        assert_eq!(Fixed::from_int(1).raw(), F);
        assert_eq!(Fixed::from_int(-7).to_int_trunc(), -7);
        assert_eq!(Fixed::from_int(63).to_int_round(), 63);
    }

    #[test]
    fn trunc_goes_toward_zero() {
        assert_eq!(Fixed::from_raw(F + F / 4).to_int_trunc(), 1);
        assert_eq!(Fixed::from_raw(-F - F / 4).to_int_trunc(), -1);
    }

    #[test]
    fn round_ties_go_away_from_zero() {
        assert_eq!(Fixed::from_raw(F / 2).to_int_round(), 1);
        assert_eq!(Fixed::from_raw(F / 2 - 1).to_int_round(), 0);
        assert_eq!(Fixed::from_raw(-F / 2).to_int_round(), -1);
        assert_eq!(Fixed::from_raw(-F / 2 + 1).to_int_round(), 0);
    }

    #[test]
    fn int_operands_are_scaled() {
        let x = Fixed::from_int(3).add_int(2);
        assert_eq!(x.to_int_trunc(), 5);
        assert_eq!(x.sub_int(5), Fixed::ZERO);
    }

    #[test]
    fn mul_div_keep_fractional_precision() {
        // 59/60 is the load-average decay factor; it must not collapse
        // to 0 or 1.
        let f = Fixed::from_int(59).div(Fixed::from_int(60));
        assert!(f > Fixed::ZERO && f < Fixed::from_int(1));
        assert_eq!(f.mul_int(60).to_int_round(), 59);

        let half = Fixed::from_int(1).div(Fixed::from_int(2));
        assert_eq!(half.mul(Fixed::from_int(10)).to_int_trunc(), 5);
    }

    #[test]
    fn mul_widens_past_i32() {
        // 1000 * 1000 overflows i32 in raw form without the i64 widening.
        let k = Fixed::from_int(1000);
        assert_eq!(k.mul(k).to_int_trunc(), 1_000_000);
    }

    proptest! {
        #[test]
        fn round_trip(n in -100_000i32..100_000) {
            prop_assert_eq!(Fixed::from_int(n).to_int_round(), n);
            prop_assert_eq!(Fixed::from_int(n).to_int_trunc(), n);
        }

        #[test]
        fn add_sub_int_are_inverses(n in -50_000i32..50_000, m in -1_000i32..1_000) {
            let x = Fixed::from_int(n);
            prop_assert_eq!(x.add_int(m).sub_int(m), x);
        }

        #[test]
        fn addition_matches_integer_addition(a in -50_000i32..50_000, b in -50_000i32..50_000) {
            let sum = Fixed::from_int(a) + Fixed::from_int(b);
            prop_assert_eq!(sum.to_int_round(), a + b);
        }
    }
}
