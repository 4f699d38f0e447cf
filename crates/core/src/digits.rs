//! Decimal size estimates and submission checks for Mersenne numbers.

use crate::error::CoreError;
use crate::types::Exponent;

/// Largest decimal expansion the service will materialise.
pub const MAX_ARTIFACT_DIGITS: u64 = 5_000_000;

/// Number of decimal digits of `2^p - 1`: `floor(p * log10 2) + 1`.
pub fn estimated_digits(p: Exponent) -> u64 {
    (p as f64 * std::f64::consts::LOG10_2).floor() as u64 + 1
}

/// A Lucas-Lehmer run needs `p >= 2`.
pub fn validate_run_exponent(p: Exponent) -> Result<(), CoreError> {
    if p < 2 {
        return Err(CoreError::Validation(format!("p must be >= 2, got {p}")));
    }
    Ok(())
}

/// Digits generation needs `p >= 1` and an expansion within the size cap.
pub fn validate_digits_exponent(p: Exponent) -> Result<(), CoreError> {
    if p < 1 {
        return Err(CoreError::Validation("p must be >= 1".to_string()));
    }
    let digits = estimated_digits(p);
    if digits > MAX_ARTIFACT_DIGITS {
        return Err(CoreError::Validation(format!(
            "decimal expansion of M{p} is too large ({digits} digits)"
        )));
    }
    Ok(())
}
