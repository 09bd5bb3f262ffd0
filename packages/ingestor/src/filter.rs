//! Stream Filter
//!
//! Turns one batch from the upstream transaction stream into point credits.
//! Only transactions sent to a registered platform contract earn points:
//! `dex` and `lsd` calls scale with the native value sent, every other
//! category earns a flat point.
//!
//! The filter is pure: no I/O, no suspension, input order preserved.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::credit::PointCredit;
use crate::decoder::{decode_value, scaled_points, DecodeError, FLAT_POINTS};
use crate::registry::PlatformRegistry;

/// Errors that abort filtering of a whole batch
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Malformed stream batch: {0}")]
    MalformedBatch(#[from] serde_json::Error),

    #[error("Stream batch has no data")]
    EmptyData,

    #[error("Transaction #{index} to {platform}: {source}")]
    InvalidValue {
        index: usize,
        platform: String,
        #[source]
        source: DecodeError,
    },

    #[error("Transaction #{index} to {platform} has no sender")]
    MissingSender { index: usize, platform: String },

    #[error("Transaction #{index} to {platform} has a non-string sender: {sender}")]
    InvalidSender {
        index: usize,
        platform: String,
        sender: Value,
    },
}

/// Upstream batch envelope: `{ data: [ { transactions: [...] }, ... ] }`
#[derive(Debug, Deserialize)]
struct StreamBatch {
    data: Vec<Value>,
}

/// The block-level element read from `data[0]`
#[derive(Debug, Clone, Deserialize)]
pub struct StreamBlock {
    pub transactions: Vec<StreamTransaction>,
}

/// The transaction fields the filter reads; everything else is ignored.
///
/// `from` and `hash` stay untyped so that odd values on transactions that
/// match no platform never reject the batch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamTransaction {
    #[serde(default)]
    pub hash: Option<Value>,
    #[serde(default)]
    pub from: Option<Value>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

/// What the filter hands to the writer for one batch
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutput {
    /// At least one transaction earned points
    Credits(Vec<PointCredit>),
    /// Nothing matched; the writer should not be invoked
    NoOutput,
    /// The batch could not be filtered
    Error(String),
}

impl FilterOutput {
    /// Wrap a filter result into the handoff shape
    pub fn from_result(result: Result<Option<Vec<PointCredit>>, FilterError>) -> Self {
        match result {
            Ok(Some(credits)) => FilterOutput::Credits(credits),
            Ok(None) => FilterOutput::NoOutput,
            Err(e) => FilterOutput::Error(e.to_string()),
        }
    }

    /// Encode as `{points: [...]}`, `null` or `{error: message}`
    pub fn to_json(&self) -> Value {
        match self {
            FilterOutput::Credits(credits) => json!({
                "points": credits.iter().map(PointCredit::to_json).collect::<Vec<_>>()
            }),
            FilterOutput::NoOutput => Value::Null,
            FilterOutput::Error(message) => json!({ "error": message }),
        }
    }
}

/// Filter a raw upstream batch and wrap the outcome for the writer
pub fn run(batch: &Value, registry: &PlatformRegistry) -> FilterOutput {
    FilterOutput::from_result(filter_batch(batch, registry))
}

/// Filter a raw upstream batch.
///
/// Only the first element of `data` is read.
///
/// # Returns
/// `Ok(Some(credits))` when something matched, `Ok(None)` when nothing did
pub fn filter_batch(
    batch: &Value,
    registry: &PlatformRegistry,
) -> Result<Option<Vec<PointCredit>>, FilterError> {
    let envelope = StreamBatch::deserialize(batch)?;
    let first = envelope.data.into_iter().next().ok_or(FilterError::EmptyData)?;
    let block = StreamBlock::deserialize(first)?;

    let credits = filter_transactions(&block.transactions, registry)?;
    debug!(
        "Filtered {} transactions into {} credits",
        block.transactions.len(),
        credits.len()
    );

    if credits.is_empty() {
        Ok(None)
    } else {
        Ok(Some(credits))
    }
}

/// Convert transactions into credits, one per matching transaction
pub fn filter_transactions(
    transactions: &[StreamTransaction],
    registry: &PlatformRegistry,
) -> Result<Vec<PointCredit>, FilterError> {
    let mut credits = Vec::new();

    for (index, tx) in transactions.iter().enumerate() {
        let Some(to) = tx.to.as_deref().filter(|to| !to.is_empty()) else {
            continue;
        };
        let Some(info) = registry.lookup(to) else {
            continue;
        };

        let points = if info.category.is_value_scaled() {
            let value =
                decode_value(tx.value.as_ref()).map_err(|source| FilterError::InvalidValue {
                    index,
                    platform: info.platform.clone(),
                    source,
                })?;
            match scaled_points(value) {
                Some(points) => points,
                None => {
                    debug!("Skipping zero-value {} call to {}", info.category, info.platform);
                    continue;
                }
            }
        } else {
            FLAT_POINTS
        };

        let from = match &tx.from {
            Some(Value::String(from)) if !from.is_empty() => from.as_str(),
            None | Some(Value::Null) | Some(Value::String(_)) => {
                return Err(FilterError::MissingSender {
                    index,
                    platform: info.platform.clone(),
                })
            }
            Some(other) => {
                return Err(FilterError::InvalidSender {
                    index,
                    platform: info.platform.clone(),
                    sender: other.clone(),
                })
            }
        };

        let mut credit = PointCredit::new(from, info.category, info.platform.clone(), points);
        match &tx.hash {
            Some(Value::String(hash)) if !hash.is_empty() => credit = credit.with_tx_hash(hash),
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(other) => debug!("Ignoring non-string hash {} on transaction #{}", other, index),
        }
        credits.push(credit);
    }

    Ok(credits)
}
