use crate::error::MarketError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};

/// Number of decimal places kept for credit quantities and monetary values.
pub const SCALE: u32 = 2;

fn round(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// A strictly positive number of carbon credits.
///
/// Used for everything a caller asks for (issuance, purchase, retirement) so the
/// workflows never have to re-check for zero or negative requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Quantity(Decimal);

impl Quantity {
    pub fn new(value: Decimal) -> Result<Self, MarketError> {
        if value <= Decimal::ZERO {
            return Err(MarketError::validation("Quantity must be positive"));
        }
        if round(value) != value {
            return Err(MarketError::validation(format!(
                "Quantity supports at most {SCALE} decimal places"
            )));
        }
        Ok(Self(round(value)))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Quantity {
    type Error = MarketError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for Decimal {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A non-negative monetary amount in the marketplace currency (USD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, MarketError> {
        if value < Decimal::ZERO {
            return Err(MarketError::validation("Amount cannot be negative"));
        }
        Ok(Self(round(value)))
    }

    /// A price must be strictly positive.
    pub fn price(value: Decimal) -> Result<Self, MarketError> {
        if value <= Decimal::ZERO {
            return Err(MarketError::validation("Price must be positive"));
        }
        Self::new(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Applies a fractional rate (e.g. `0.02` for 2%).
    pub fn percent(self, rate: Decimal) -> Self {
        Self(round(self.0 * rate))
    }

    /// Whole cents, as expected by card payment gateways.
    pub fn cents(&self) -> i64 {
        use rust_decimal::prelude::ToPrimitive;
        (self.0 * Decimal::ONE_HUNDRED).trunc().to_i64().unwrap_or(i64::MAX)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = MarketError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self((self.0 - rhs.0).max(Decimal::ZERO))
    }
}

impl Mul<Quantity> for Money {
    type Output = Money;
    fn mul(self, rhs: Quantity) -> Self::Output {
        Money(round(self.0 * rhs.0))
    }
}
