//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal for exact arithmetic. Values are parsed from their
//! string form and never pass through a float. A `Decimal` is an unscaled
//! integer (mantissa) with a scale, so its exponent is `-scale`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DecimalError;

/// Parse a decimal string exactly.
///
/// Inputs that would need rounding to fit (more than 28 fractional digits
/// or a mantissa wider than 96 bits) are rejected rather than rounded.
pub fn parse(input: &str) -> Result<Decimal, DecimalError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DecimalError::Parse {
            input: input.to_string(),
            reason: "empty value".to_string(),
        });
    }
    Decimal::from_str_exact(trimmed).map_err(|e| DecimalError::Parse {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Compare two decimals, returning -1, 0 or 1.
///
/// Resolution order:
/// 1. sign (negative < zero < positive);
/// 2. equal exponents compare their unscaled integers;
/// 3. equal signs with different exponents use the exponent direction: a
///    positive value with the larger exponent (fewer fractional digits) is
///    the greater one, and the reverse for negative values.
///
/// Step 3 is the historical candle comparison contract and is not a general
/// decimal ordering: `compare(100.5, 2)` is -1. Candle high/low tracking
/// depends on this exact behavior.
pub fn compare(a: &Decimal, b: &Decimal) -> i32 {
    let sign_a = signum(a);
    let sign_b = signum(b);
    if sign_a != sign_b {
        return if sign_a > sign_b { 1 } else { -1 };
    }
    if sign_a == 0 {
        return 0;
    }

    let exp_a = -(a.scale() as i64);
    let exp_b = -(b.scale() as i64);
    if exp_a == exp_b {
        return match a.mantissa().cmp(&b.mantissa()) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        };
    }

    if sign_a < 0 {
        if exp_a < exp_b {
            1
        } else {
            -1
        }
    } else if exp_a < exp_b {
        -1
    } else {
        1
    }
}

/// Exact sum of two decimals.
pub fn add(a: &Decimal, b: &Decimal) -> Result<Decimal, DecimalError> {
    a.checked_add(*b).ok_or_else(|| DecimalError::Overflow {
        lhs: a.to_string(),
        rhs: b.to_string(),
    })
}

fn signum(d: &Decimal) -> i32 {
    if d.is_zero() {
        0
    } else if d.is_sign_negative() {
        -1
    } else {
        1
    }
}

/// Trade price.
///
/// Serialized as a string so no precision is lost on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    /// Wrap a decimal, rejecting negative prices.
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Candle comparison of two prices, see [`compare`].
    pub fn compare(&self, other: &Price) -> i32 {
        compare(&self.0, &other.0)
    }
}

impl FromStr for Price {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = parse(s)?;
        Self::try_new(value).ok_or_else(|| DecimalError::Negative {
            input: s.to_string(),
        })
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Traded amount or accumulated volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Wrap a decimal, rejecting negative quantities.
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Exact sum, see [`add`].
    pub fn checked_add(&self, other: &Quantity) -> Result<Quantity, DecimalError> {
        add(&self.0, &other.0).map(Quantity)
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Self::zero()
    }
}

impl FromStr for Quantity {
    type Err = DecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = parse(s)?;
        Self::try_new(value).ok_or_else(|| DecimalError::Negative {
            input: s.to_string(),
        })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
