//! Amounts in integer base units
//!
//! Consensus arithmetic never touches floating point. Collaborators that speak
//! in fractional coins go through [`parse_amount`] at the boundary.

use thiserror::Error;

use crate::constants::{COIN, DECIMAL_PLACES};

/// Amount in base units (1 coin = [`COIN`] base units)
pub type Amount = u64;

/// Errors converting a coin value into base units
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is NaN or infinite")]
    NotFinite,
    #[error("amount is negative")]
    Negative,
    #[error("amount overflows base units")]
    Overflow,
}

/// Convert a coin value into base units, rounding to the nearest unit
pub fn parse_amount(coins: f64) -> Result<Amount, AmountError> {
    if !coins.is_finite() {
        return Err(AmountError::NotFinite);
    }
    if coins < 0.0 {
        return Err(AmountError::Negative);
    }
    let units = (coins * COIN as f64).round();
    if units >= u64::MAX as f64 {
        return Err(AmountError::Overflow);
    }
    Ok(units as u64)
}

/// Render base units as a decimal coin string
pub fn format_amount(amount: Amount) -> String {
    format!(
        "{}.{:0width$}",
        amount / COIN,
        amount % COIN,
        width = DECIMAL_PLACES as usize
    )
}

/// Checked sum, `None` on overflow
pub fn checked_sum<I: IntoIterator<Item = Amount>>(amounts: I) -> Option<Amount> {
    amounts
        .into_iter()
        .try_fold(0u64, |acc, amount| acc.checked_add(amount))
}
