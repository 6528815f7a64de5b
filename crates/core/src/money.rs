//! Monetary amounts as immutable value objects.
//!
//! Amounts are carried in the smallest currency unit (e.g. halalas, cents) to
//! keep arithmetic exact. A sequence's amount at risk is frozen at creation,
//! so `Money` is never mutated in place.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::{DunningError, DunningResult};
use crate::value_object::ValueObject;

/// ISO 4217-style currency code (three uppercase ASCII letters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> DunningResult<Self> {
        let code = code.into();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(DunningError::validation(format!(
                "currency must be a 3-letter uppercase code, got {code:?}"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An amount in the smallest unit of its currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: u64,
    currency: Currency,
}

impl Money {
    pub fn new(amount: u64, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Amount in the smallest currency unit.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }
}

impl ValueObject for Money {}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}
