//! Phone normalization for the messaging gateway.
//!
//! Best-effort heuristic, not E.164 validation: a number whose digits do not
//! start with the default country code gets that code prepended, so numbers
//! from other countries are not detected.

use crate::errors::PhoneError;

/// Minimum number of digits accepted.
pub const MIN_DIGITS: usize = 10;

/// Normalizes a free-form phone string to `+<digits>`.
///
/// Strips every non-digit, rejects fewer than [`MIN_DIGITS`] digits, and
/// prefixes `default_country_code` unless the digits already start with it.
pub fn normalize(raw: &str, default_country_code: &str) -> Result<String, PhoneError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    if digits.len() < MIN_DIGITS {
        return Err(PhoneError::TooShort {
            digits: digits.len(),
            min: MIN_DIGITS,
        });
    }

    if digits.starts_with(default_country_code) {
        Ok(format!("+{}", digits))
    } else {
        Ok(format!("+{}{}", default_country_code, digits))
    }
}
