//! 17.14 fixed-point numbers.
//!
//! The kernel has no floating point. The MLFQS scheduler instead represents
//! real numbers such as `load_avg` and `recent_cpu` in a 32-bit integer whose
//! lowest 14 bits are the fraction: the value `x` is stored as `x * 2^14`.
//!
//! | Operation                 | Result                                   |
//! |---------------------------|------------------------------------------|
//! | `Fixed::from_int(n)`      | `n * F`                                  |
//! | `x.to_int_trunc()`        | `x / F`, rounding toward zero            |
//! | `x.to_int_round()`        | nearest integer, ties away from zero     |
//! | `x + y`, `x - y`          | plain integer addition and subtraction   |
//! | `x + n`, `x - n`          | `x ± n * F`                              |
//! | `x * y`                   | `(x as i64) * y / F`                     |
//! | `x / y`                   | `(x as i64) * F / y`                     |
//! | `x * n`, `x / n`          | plain integer multiplication and division |
//!
//! where `F = 2^14`.
use core::ops::{Add, Div, Mul, Sub};

/// Number of fraction bits.
pub const FRACTION_BITS: u32 = 14;
/// The scale of a fixed-point number.
pub const F: i32 = 1 << FRACTION_BITS;

/// A signed 17.14 fixed-point number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(i32);

impl Fixed {
    /// Zero.
    pub const ZERO: Fixed = Fixed(0);

    /// Converts the integer `n` to a fixed-point number.
    pub const fn from_int(n: i32) -> Self {
        Self(n * F)
    }

    /// Builds a fixed-point number from its raw representation.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw representation.
    pub const fn into_raw(self) -> i32 {
        self.0
    }

    /// Converts to an integer, rounding toward zero.
    pub const fn to_int_trunc(self) -> i32 {
        self.0 / F
    }

    /// Converts to the nearest integer, rounding ties away from zero.
    pub const fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
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

impl Mul for Fixed {
    type Output = Fixed;

    fn mul(self, rhs: Fixed) -> Fixed {
        Fixed(((self.0 as i64) * (rhs.0 as i64) / F as i64) as i32)
    }
}

impl Div for Fixed {
    type Output = Fixed;

    fn div(self, rhs: Fixed) -> Fixed {
        Fixed(((self.0 as i64) * F as i64 / rhs.0 as i64) as i32)
    }
}

impl Add<i32> for Fixed {
    type Output = Fixed;

    fn add(self, n: i32) -> Fixed {
        Fixed(self.0 + n * F)
    }
}

impl Sub<i32> for Fixed {
    type Output = Fixed;

    fn sub(self, n: i32) -> Fixed {
        Fixed(self.0 - n * F)
    }
}

impl Mul<i32> for Fixed {
    type Output = Fixed;

    fn mul(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }
}

impl Div<i32> for Fixed {
    type Output = Fixed;

    fn div(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }
}

impl core::fmt::Display for Fixed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:.3}", self.0 as f64 / F as f64)
    }
}
