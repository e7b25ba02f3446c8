//! MinorUnits - Non-negative integer money
//!
//! All balances in a designated account are held as whole minor units
//! (cents) of a single currency. Negative balances are unrepresentable.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur when working with amounts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Amount cannot be negative: {0}")]
    NegativeAmount(i64),
}

/// A non-negative amount of money expressed in minor units.
///
/// # Invariant
/// The inner value is always >= 0. This is enforced by the constructor.
///
/// # Example
/// ```
/// use apgms_core::MinorUnits;
///
/// let amount = MinorUnits::new(12_345).unwrap();
/// assert_eq!(amount.value(), 12_345);
/// assert_eq!(amount.to_string(), "123.45");
///
/// // Negative amounts are rejected
/// assert!(MinorUnits::new(-1).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct MinorUnits(i64);

impl MinorUnits {
    /// Zero amount constant
    pub const ZERO: Self = Self(0);

    /// Number of minor units in one major unit
    pub const SCALE: u32 = 2;

    /// Create a new amount, rejecting negative values.
    pub fn new(value: i64) -> Result<Self, AmountError> {
        if value < 0 {
            Err(AmountError::NegativeAmount(value))
        } else {
            Ok(Self(value))
        }
    }

    /// Get the raw minor unit count
    #[inline]
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Check if the amount is zero
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Addition that refuses to overflow
    pub fn checked_add(&self, other: MinorUnits) -> Option<MinorUnits> {
        self.0.checked_add(other.0).map(MinorUnits)
    }

    /// Subtraction - returns None if the result would be negative
    pub fn checked_sub(&self, other: MinorUnits) -> Option<MinorUnits> {
        let result = self.0.checked_sub(other.0)?;
        if result < 0 {
            None
        } else {
            Some(MinorUnits(result))
        }
    }

    /// Major-unit rendering (e.g. dollars) for display and reports
    pub fn to_major(&self) -> Decimal {
        Decimal::new(self.0, Self::SCALE)
    }
}

impl fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_major())
    }
}

impl TryFrom<i64> for MinorUnits {
    type Error = AmountError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MinorUnits> for i64 {
    fn from(amount: MinorUnits) -> Self {
        amount.0
    }
}

impl Default for MinorUnits {
    fn default() -> Self {
        Self::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_positive() {
        let amount = MinorUnits::new(100).unwrap();
        assert_eq!(amount.value(), 100);
    }

    #[test]
    fn test_amount_zero() {
        assert!(MinorUnits::new(0).unwrap().is_zero());
    }

    #[test]
    fn test_amount_negative_rejected() {
        let result = MinorUnits::new(-100);
        assert!(matches!(result, Err(AmountError::NegativeAmount(-100))));
    }

    #[test]
    fn test_checked_sub_prevents_negative() {
        let a = MinorUnits::new(50).unwrap();
        let b = MinorUnits::new(100).unwrap();
        assert!(a.checked_sub(b).is_none());
        assert_eq!(b.checked_sub(a), Some(MinorUnits::new(50).unwrap()));
    }

    #[test]
    fn test_checked_add_overflow() {
        let max = MinorUnits::new(i64::MAX).unwrap();
        assert!(max.checked_add(MinorUnits::new(1).unwrap()).is_none());
    }

    #[test]
    fn test_major_rendering() {
        assert_eq!(MinorUnits::new(500_000).unwrap().to_major(), dec!(5000.00));
        assert_eq!(MinorUnits::new(7).unwrap().to_string(), "0.07");
    }

    #[test]
    fn test_serde_rejects_negative() {
        let parsed: Result<MinorUnits, _> = serde_json::from_str("-5");
        assert!(parsed.is_err());

        let parsed: MinorUnits = serde_json::from_str("12345").unwrap();
        assert_eq!(parsed.value(), 12_345);
    }
}
