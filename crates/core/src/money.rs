//! Fixed-point currency amounts.

use core::fmt;
use core::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Number of fractional digits carried by every amount (cents).
pub const MONEY_SCALE: u32 = 2;

/// Largest amount that fits a `NUMERIC(12,2)` column: 9,999,999,999.99.
pub const MONEY_MAX_CENTS: i64 = 999_999_999_999;

/// A currency amount with exactly two fractional digits.
///
/// Backed by `rust_decimal::Decimal`, so sums of line items and payments never
/// drift the way binary floating point does. Construction from external input
/// rejects sub-cent precision; values *computed* from a rate are rounded half
/// away from zero.
///
/// Serialized as a decimal string (`"660.00"`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl ValueObject for Money {}

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const MAX: Money = Money(Decimal::from_parts(
        MONEY_MAX_CENTS as u32,
        (MONEY_MAX_CENTS >> 32) as u32,
        0,
        false,
        MONEY_SCALE,
    ));

    /// Build an amount from an integer number of cents.
    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, MONEY_SCALE))
    }

    /// Accept an externally supplied decimal, rejecting sub-cent precision
    /// and magnitudes beyond [`Money::MAX`].
    pub fn try_from_decimal(value: Decimal) -> DomainResult<Self> {
        if value.normalize().scale() > MONEY_SCALE {
            return Err(DomainError::bad_request(format!(
                "amount {value} has more than {MONEY_SCALE} decimal places"
            )));
        }
        Self(with_scale(value)).within_limit("amount")
    }

    /// Pass the amount through unless its magnitude exceeds [`Money::MAX`].
    pub fn within_limit(self, what: &str) -> DomainResult<Self> {
        if self.0.abs() > Self::MAX.0 {
            return Err(DomainError::bad_request(format!(
                "{what} {self} exceeds the maximum of {}",
                Self::MAX
            )));
        }
        Ok(self)
    }

    /// Round a computed decimal to cents (half away from zero).
    pub fn round(value: Decimal) -> Self {
        Self(with_scale(value.round_dp_with_strategy(
            MONEY_SCALE,
            RoundingStrategy::MidpointAwayFromZero,
        )))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(|d| Self(with_scale(d)))
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(|d| Self(with_scale(d)))
    }

    /// Multiply by an integer quantity (line amount = quantity × unit price).
    pub fn checked_mul_qty(self, quantity: i32) -> Option<Money> {
        self.0
            .checked_mul(Decimal::from(quantity))
            .map(|d| Self(with_scale(d)))
    }

    /// Apply a fractional rate (e.g. a tax rate of `0.16`), rounding to cents.
    pub fn checked_apply_rate(self, rate: Decimal) -> Option<Money> {
        self.0.checked_mul(rate).map(Self::round)
    }

    /// Sum amounts, returning `None` on overflow.
    pub fn checked_sum<I>(amounts: I) -> Option<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.checked_add(m))
    }
}

fn with_scale(mut value: Decimal) -> Decimal {
    value.rescale(MONEY_SCALE);
    value
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Money {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| DomainError::bad_request(format!("invalid amount '{s}': {e}")))?;
        Self::try_from_decimal(value)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = DomainError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::try_from_decimal(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}
