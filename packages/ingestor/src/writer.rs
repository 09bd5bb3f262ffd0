//! Ledger Writer
//!
//! Applies point credits to the ledger one record at a time and reports the
//! outcome of the whole batch as a structured result.
//!
//! A bad record never sinks its batch: malformed records and failed statements
//! are logged and skipped. Only a pool that cannot be established turns the
//! batch into an error result.

use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::credit::PointCredit;
use crate::ledger::{self, ApplyOutcome};
use crate::store::{LedgerPool, StoreError};

/// Errors that abort a whole write
#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid writer input: {0}")]
    InvalidInput(String),
}

impl WriteError {
    /// Name reported as `data.error_type`
    pub fn error_type(&self) -> &'static str {
        match self {
            WriteError::Store(e) => e.kind(),
            WriteError::InvalidInput(_) => "InvalidInput",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    Success,
    Error,
}

/// Per-batch payload of a [`WriteReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportData {
    Success {
        /// Records attempted, valid or not
        total_points: usize,
        applied: usize,
        duplicates: usize,
        failed: usize,
    },
    Error {
        error_type: String,
        points_attempted: usize,
    },
}

/// Result of one writer invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReport {
    pub status: WriteStatus,
    pub message: String,
    /// RFC 3339 UTC, millisecond precision
    pub timestamp: String,
    pub processing_time_ms: u64,
    pub data: ReportData,
}

impl WriteReport {
    fn success(tally: &Tally, started: Instant) -> Self {
        Self {
            status: WriteStatus::Success,
            message: format!(
                "Processed {} point records ({} applied, {} duplicates, {} failed)",
                tally.total, tally.applied, tally.duplicates, tally.failed
            ),
            timestamp: now_rfc3339(),
            processing_time_ms: elapsed_ms(started),
            data: ReportData::Success {
                total_points: tally.total,
                applied: tally.applied,
                duplicates: tally.duplicates,
                failed: tally.failed,
            },
        }
    }

    fn failure(err: &WriteError, attempted: usize, started: Instant) -> Self {
        Self {
            status: WriteStatus::Error,
            message: err.to_string(),
            timestamp: now_rfc3339(),
            processing_time_ms: elapsed_ms(started),
            data: ReportData::Error {
                error_type: err.error_type().to_string(),
                points_attempted: attempted,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WriteStatus::Success
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    applied: usize,
    duplicates: usize,
    failed: usize,
}

/// Applies credits through a shared pool
#[derive(Clone)]
pub struct LedgerWriter {
    pool: Arc<LedgerPool>,
    config: WriterConfig,
}

impl LedgerWriter {
    pub fn new(pool: Arc<LedgerPool>, config: WriterConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &Arc<LedgerPool> {
        &self.pool
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Apply a writer invocation of the form `{points: [[...], ...]}`.
    ///
    /// Each record is decoded on its own; a malformed record is counted as
    /// failed and the rest of the batch still runs.
    pub async fn write_handoff(&self, invocation: &Value) -> WriteReport {
        let started = Instant::now();
        let records = invocation.get("points").and_then(Value::as_array);
        let attempted = records.map_or(0, Vec::len);

        if let Err(e) = self.pool.get().await {
            return WriteReport::failure(&WriteError::Store(e), attempted, started);
        }

        let Some(records) = records else {
            let err = WriteError::InvalidInput("expected an object with a 'points' array".into());
            error!("{}", err);
            return WriteReport::failure(&err, 0, started);
        };

        let mut tally = Tally::default();
        for (index, record) in records.iter().enumerate() {
            tally.total += 1;
            match PointCredit::from_json(record) {
                Ok(credit) => self.apply_one(index, &credit, &mut tally).await,
                Err(e) => {
                    warn!("Skipping malformed point record #{}: {}", index, e);
                    tally.failed += 1;
                }
            }
        }

        self.finish(tally, started)
    }

    /// Apply already-decoded credits in order
    pub async fn write_credits(&self, credits: &[PointCredit]) -> WriteReport {
        let started = Instant::now();

        if let Err(e) = self.pool.get().await {
            return WriteReport::failure(&WriteError::Store(e), credits.len(), started);
        }

        let mut tally = Tally::default();
        for (index, credit) in credits.iter().enumerate() {
            tally.total += 1;
            self.apply_one(index, credit, &mut tally).await;
        }

        self.finish(tally, started)
    }

    async fn apply_one(&self, index: usize, credit: &PointCredit, tally: &mut Tally) {
        let credit = credit.normalized();
        let pool = match self.pool.get().await {
            Ok(pool) => pool,
            Err(e) => {
                error!("Ledger pool unavailable for record #{}: {}", index, e);
                tally.failed += 1;
                return;
            }
        };

        match ledger::apply_credit(pool, &credit, self.config.dedupe_by_tx_hash).await {
            Ok(ApplyOutcome::Applied) => {
                debug!(
                    "Credited {} points to {} on {} ({})",
                    credit.points, credit.address, credit.platform, credit.category
                );
                tally.applied += 1;
            }
            Ok(ApplyOutcome::Duplicate) => {
                debug!(
                    "Transaction {} already credited, skipping record #{}",
                    credit.tx_hash.as_deref().unwrap_or("-"),
                    index
                );
                tally.duplicates += 1;
            }
            Err(e) => {
                error!(
                    "Failed to apply record #{} for {} on {} (retryable: {}): {}",
                    index,
                    credit.address,
                    credit.platform,
                    e.is_retryable(),
                    e
                );
                tally.failed += 1;
            }
        }
    }

    fn finish(&self, tally: Tally, started: Instant) -> WriteReport {
        let report = WriteReport::success(&tally, started);
        info!("{}", report.message);
        report
    }
}
