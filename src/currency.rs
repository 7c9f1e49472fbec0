// ===============================
// src/currency.rs
// ===============================
//
// Fixed-point money. Balances, prices and reservations are all whole cents
// held in an i64; no floating point touches a balance.
//
use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Mul};
use std::str::FromStr;

use crate::error::TradeError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    pub fn cents(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// `self - rhs`, refusing to go below zero.
    pub fn checked_sub(self, rhs: Money) -> Result<Money, TradeError> {
        if rhs > self {
            return Err(TradeError::InsufficientFunds { required: rhs, available: self });
        }
        Ok(Money(self.0 - rhs.0))
    }

    /// `self + rhs`, refusing to overflow.
    pub fn checked_add(self, rhs: Money) -> Result<Money, TradeError> {
        self.0.checked_add(rhs.0).map(Money).ok_or(TradeError::InvalidAmount(rhs))
    }

    /// `self * units`, refusing to overflow.
    pub fn checked_mul(self, units: u64) -> Result<Money, TradeError> {
        i64::try_from(units)
            .ok()
            .and_then(|u| self.0.checked_mul(u))
            .map(Money)
            .ok_or(TradeError::InvalidAmount(self))
    }

    /// Floor-division of a cash amount into whole units at `unit_price`.
    ///
    /// Returns `(whole_units, remainder)` with
    /// `whole_units * unit_price + remainder == self` and
    /// `0 <= remainder < unit_price`.
    pub fn fits_into(self, unit_price: Money) -> Result<(u64, Money), TradeError> {
        if !unit_price.is_positive() {
            return Err(TradeError::InvalidAmount(unit_price));
        }
        if self.0 < 0 {
            return Err(TradeError::InvalidAmount(self));
        }
        let units = self.0 / unit_price.0;
        let rem = self.0 % unit_price.0;
        Ok((units as u64, Money(rem)))
    }

    /// Parse `"<dollars>.<cents>"`. The separator is mandatory and at most
    /// two fractional digits are accepted.
    pub fn parse(s: &str) -> Result<Money, TradeError> {
        let bad = || TradeError::InvalidFormat(format!("not a money amount: {s:?}"));

        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (dollars, cents) = body.split_once('.').ok_or_else(bad)?;
        if dollars.is_empty()
            || cents.is_empty()
            || cents.len() > 2
            || !dollars.bytes().all(|b| b.is_ascii_digit())
            || !cents.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(bad());
        }

        let d: i64 = dollars.parse().map_err(|_| bad())?;
        let mut c: i64 = cents.parse().map_err(|_| bad())?;
        if cents.len() == 1 {
            c *= 10;
        }
        let total = d.checked_mul(100).and_then(|x| x.checked_add(c)).ok_or_else(bad)?;
        Ok(Money(if negative { -total } else { total }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = TradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::parse(s)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// Operators saturate. Ledger mutations go through the checked forms.
impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

// price * units
impl Mul<u64> for Money {
    type Output = Money;

    fn mul(self, units: u64) -> Money {
        let units = i64::try_from(units).unwrap_or(i64::MAX);
        Money(self.0.saturating_mul(units))
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}
