//! Value Decoding
//!
//! Decodes the native `value` of stream transactions into an arbitrary-precision
//! integer and converts it into points for value-scaled categories.
//!
//! The conversion goes through `f64`, so amounts above 2^53 wei lose
//! precision before the floor is taken.

use std::str::FromStr;

use alloy::primitives::U256;
use serde_json::Value;
use thiserror::Error;

/// Smallest units per whole token (18 decimals)
pub const WEI_PER_TOKEN: f64 = 1e18;

/// Points awarded for any matching non-scaled transaction, and the floor for
/// scaled ones
pub const FLAT_POINTS: u64 = 1;

/// Largest credit the ledger's integer column can hold
pub const MAX_POINTS: u64 = i64::MAX as u64;

/// Errors that can occur while decoding a transaction value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Invalid value {0:?}: {1}")]
    InvalidValue(String, String),

    #[error("Negative value: {0}")]
    NegativeValue(String),

    #[error("Unsupported value type: {0}")]
    UnsupportedType(&'static str),
}

/// Decode a transaction `value` field.
///
/// Accepts decimal strings, `0x`-prefixed hex strings and JSON integers.
/// A missing, null or empty value decodes to zero.
pub fn decode_value(value: Option<&Value>) -> Result<U256, DecodeError> {
    match value {
        None | Some(Value::Null) => Ok(U256::ZERO),
        Some(Value::String(s)) => decode_value_str(s),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                return Ok(U256::from(v));
            }
            if n.as_i64().is_some() {
                return Err(DecodeError::NegativeValue(n.to_string()));
            }
            // Floats are only accepted when they hold an exact non-negative integer
            match n.as_f64() {
                Some(f) if f < 0.0 => Err(DecodeError::NegativeValue(n.to_string())),
                Some(f) if f.is_finite() && f.fract() == 0.0 && f <= u128::MAX as f64 => {
                    Ok(U256::from(f as u128))
                }
                _ => Err(DecodeError::InvalidValue(
                    n.to_string(),
                    "not an integer".to_string(),
                )),
            }
        }
        Some(Value::Bool(_)) => Err(DecodeError::UnsupportedType("bool")),
        Some(Value::Array(_)) => Err(DecodeError::UnsupportedType("array")),
        Some(Value::Object(_)) => Err(DecodeError::UnsupportedType("object")),
    }
}

/// Decode a string value (decimal or 0x-prefixed hex)
pub fn decode_value_str(s: &str) -> Result<U256, DecodeError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    if s.starts_with('-') {
        return Err(DecodeError::NegativeValue(s.to_string()));
    }
    U256::from_str(s).map_err(|e| DecodeError::InvalidValue(s.to_string(), e.to_string()))
}

/// Convert smallest units to whole tokens (`value / 1e18`).
///
/// The integer is first rounded to the nearest `f64`.
pub fn to_whole_tokens(value: U256) -> f64 {
    let approx = value.to_string().parse::<f64>().unwrap_or(f64::INFINITY);
    approx / WEI_PER_TOKEN
}

/// Points for a whole-token amount: at least one, otherwise the floor
pub fn points_for_amount(amount: f64) -> u64 {
    if amount < 1.0 {
        return FLAT_POINTS;
    }
    let floored = amount.floor();
    if floored >= MAX_POINTS as f64 {
        MAX_POINTS
    } else {
        floored as u64
    }
}

/// Points for a value-scaled transaction, or `None` for a zero-value call
pub fn scaled_points(value: U256) -> Option<u64> {
    if value.is_zero() {
        return None;
    }
    Some(points_for_amount(to_whole_tokens(value)))
}
