//! Point-Credit Records
//!
//! A credit says "this address earned N points on this platform". Credits travel
//! from the filter to the writer as positional JSON arrays:
//! `[address, category, platform, points]`, optionally followed by the
//! transaction hash that produced them.

use serde_json::{json, Value};
use thiserror::Error;

use crate::decoder::MAX_POINTS;
use crate::registry::{Category, UnknownCategory};

/// Errors that make a single handoff record unusable
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CreditError {
    #[error("Record is not an array")]
    NotAnArray,

    #[error("Record has {0} fields, expected 4 or 5")]
    Arity(usize),

    #[error("Field '{0}' must be a non-empty string")]
    NotAString(&'static str),

    #[error(transparent)]
    UnknownCategory(#[from] UnknownCategory),

    #[error("Invalid points value: {0}")]
    InvalidPoints(String),
}

/// One unit of filter output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointCredit {
    pub address: String,
    pub category: Category,
    pub platform: String,
    pub points: u64,
    /// Hash of the transaction that earned the credit, when the stream carried one
    pub tx_hash: Option<String>,
}

impl PointCredit {
    pub fn new(
        address: impl Into<String>,
        category: Category,
        platform: impl Into<String>,
        points: u64,
    ) -> Self {
        Self {
            address: address.into(),
            category,
            platform: platform.into(),
            points,
            tx_hash: None,
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    /// Copy with address, platform and hash lower-cased for persistence
    pub fn normalized(&self) -> Self {
        Self {
            address: self.address.trim().to_lowercase(),
            category: self.category,
            platform: self.platform.trim().to_lowercase(),
            points: self.points,
            tx_hash: self.tx_hash.as_ref().map(|h| h.trim().to_lowercase()),
        }
    }

    /// Encode as a positional handoff record
    pub fn to_json(&self) -> Value {
        match &self.tx_hash {
            Some(hash) => json!([
                self.address,
                self.category.name(),
                self.platform,
                self.points,
                hash
            ]),
            None => json!([
                self.address,
                self.category.name(),
                self.platform,
                self.points
            ]),
        }
    }

    /// Decode a positional handoff record
    pub fn from_json(record: &Value) -> Result<Self, CreditError> {
        let fields = record.as_array().ok_or(CreditError::NotAnArray)?;
        if fields.len() != 4 && fields.len() != 5 {
            return Err(CreditError::Arity(fields.len()));
        }

        let address = non_empty_str(&fields[0], "address")?;
        let category = non_empty_str(&fields[1], "category")?.parse::<Category>()?;
        let platform = non_empty_str(&fields[2], "platform")?;
        let points = parse_points(&fields[3])?;
        let tx_hash = match fields.get(4) {
            None | Some(Value::Null) => None,
            Some(v) => Some(non_empty_str(v, "tx_hash")?.to_string()),
        };

        Ok(Self {
            address: address.to_string(),
            category,
            platform: platform.to_string(),
            points,
            tx_hash,
        })
    }
}

fn non_empty_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, CreditError> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(CreditError::NotAString(field)),
    }
}

/// Points must be a positive integer that fits the ledger column.
///
/// Floats are truncated toward zero and numeric strings are accepted.
fn parse_points(value: &Value) -> Result<u64, CreditError> {
    let invalid = || CreditError::InvalidPoints(value.to_string());
    let points = match value {
        Value::Number(n) => match n.as_u64() {
            Some(p) => p,
            None => match n.as_f64() {
                Some(f) if f.is_finite() && f >= 1.0 && f < MAX_POINTS as f64 => f.trunc() as u64,
                _ => return Err(invalid()),
            },
        },
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };
    if points == 0 || points > MAX_POINTS {
        return Err(invalid());
    }
    Ok(points)
}
