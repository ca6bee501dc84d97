//! Loan term arithmetic
//!
//! All monetary math runs on arbitrary-precision integers. Wei values never
//! pass through floating point: a `f64` cannot represent large Wei amounts
//! exactly, and rounding at the LTV boundary would be exploitable.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use num_bigint::BigInt;
use thiserror::Error;

/// Maximum loan principal as a percentage of collateral value
pub const MAX_LTV_PERCENT: i64 = 80;

const SECONDS_PER_DAY: i64 = 86_400;
const DAYS_PER_YEAR: i64 = 365;
const BPS_DENOMINATOR: i64 = 10_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TermsError {
    #[error("'{0}' is not a valid Wei amount")]
    InvalidWeiAmount(String),

    #[error("Amount must be greater than 0")]
    NonPositiveAmount,

    #[error("Loan principal exceeds {MAX_LTV_PERCENT}% of collateral value")]
    LtvExceeded,
}

/// Parse a Wei amount from its decimal-string wire form.
///
/// Only plain digit strings are accepted: no sign, no decimal point, no
/// exponent. Rejecting everything else up front keeps fractional Wei and
/// scientific notation out of the ledger.
pub fn parse_wei(s: &str) -> Result<BigDecimal, TermsError> {
    let trimmed = s.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TermsError::InvalidWeiAmount(s.to_string()));
    }
    trimmed
        .parse::<BigDecimal>()
        .map_err(|_| TermsError::InvalidWeiAmount(s.to_string()))
}

/// Check the LTV cap: `principal * 100 <= collateral_value * 80`, exact
/// integer comparison. Also rejects non-positive principal.
pub fn check_ltv_cap(
    principal: &BigDecimal,
    collateral_value: &BigDecimal,
) -> Result<(), TermsError> {
    if principal <= &BigDecimal::zero() {
        return Err(TermsError::NonPositiveAmount);
    }
    if collateral_value <= &BigDecimal::zero() {
        return Err(TermsError::NonPositiveAmount);
    }
    let scaled_principal = to_bigint(principal) * 100;
    let max_scaled = to_bigint(collateral_value) * MAX_LTV_PERCENT;
    if scaled_principal > max_scaled {
        return Err(TermsError::LtvExceeded);
    }
    Ok(())
}

/// Loan-to-value ratio in basis points, floor division. Stored on the loan
/// row for audit; the acceptance check is `check_ltv_cap`, not this value.
pub fn ltv_bps(principal: &BigDecimal, collateral_value: &BigDecimal) -> i32 {
    let scaled = to_bigint(principal) * BPS_DENOMINATOR;
    let ratio = scaled / to_bigint(collateral_value);
    // An accepted loan is capped at 8000 bps, which always fits
    ratio.to_i32().unwrap_or(i32::MAX)
}

/// Whole days in a duration, floor division
pub fn duration_days(duration_seconds: i64) -> i64 {
    duration_seconds / SECONDS_PER_DAY
}

/// Projected simple (non-compounding) pro-rated interest in Wei:
/// `principal * rate_bps / 10000 * days / 365`, computed as a single
/// integer expression so the only rounding is one final floor.
pub fn projected_interest(
    principal: &BigDecimal,
    interest_rate_bps: i32,
    duration_seconds: i64,
) -> BigDecimal {
    let days = duration_days(duration_seconds);
    let numerator = to_bigint(principal) * BigInt::from(interest_rate_bps) * BigInt::from(days);
    let denominator = BigInt::from(BPS_DENOMINATOR * DAYS_PER_YEAR);
    BigDecimal::from(numerator / denominator)
}

/// Projected total return (principal + interest) in Wei
pub fn projected_return(
    principal: &BigDecimal,
    interest_rate_bps: i32,
    duration_seconds: i64,
) -> BigDecimal {
    principal + projected_interest(principal, interest_rate_bps, duration_seconds)
}

fn to_bigint(d: &BigDecimal) -> BigInt {
    // Wei values are scale-0 by construction (parse_wei / NUMERIC(78,0))
    d.with_scale(0).as_bigint_and_exponent().0
}
