//! Ingest Pipeline
//!
//! Runs one stream batch through the filter and, when anything matched, the
//! writer. A batch with no credits never touches the database.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{ConfigError, IngestorConfig};
use crate::filter::{self, FilterOutput};
use crate::ledger::{self, AddressPoints};
use crate::registry::PlatformRegistry;
use crate::store::{LedgerPool, StoreError};
use crate::writer::{LedgerWriter, WriteReport};

/// What happened to one batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// No transaction earned points
    Skipped,
    /// The filter rejected the batch
    FilterFailed(String),
    /// Credits were handed to the writer
    Written(WriteReport),
}

impl BatchOutcome {
    pub fn to_json(&self) -> Value {
        match self {
            BatchOutcome::Skipped => json!({ "status": "skipped" }),
            BatchOutcome::FilterFailed(message) => json!({ "status": "error", "error": message }),
            BatchOutcome::Written(report) => report.to_json(),
        }
    }
}

/// Filter plus writer over one registry and one pool
pub struct Pipeline {
    registry: Arc<PlatformRegistry>,
    writer: LedgerWriter,
}

impl Pipeline {
    pub fn new(registry: Arc<PlatformRegistry>, writer: LedgerWriter) -> Self {
        Self { registry, writer }
    }

    /// Build a pipeline with an unconnected pool from configuration
    pub fn from_config(config: &IngestorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(config.load_registry()?);
        let pool = Arc::new(LedgerPool::new(config.store.clone()));
        Ok(Self::new(
            registry,
            LedgerWriter::new(pool, config.writer.clone()),
        ))
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn writer(&self) -> &LedgerWriter {
        &self.writer
    }

    /// Filter only; no database access
    pub fn filter(&self, batch: &Value) -> FilterOutput {
        filter::run(batch, &self.registry)
    }

    /// Filter a batch and persist its credits
    pub async fn process(&self, batch: &Value) -> BatchOutcome {
        match self.filter(batch) {
            FilterOutput::NoOutput => {
                debug!("Batch produced no credits");
                BatchOutcome::Skipped
            }
            FilterOutput::Error(message) => {
                warn!("Filter rejected batch: {}", message);
                BatchOutcome::FilterFailed(message)
            }
            FilterOutput::Credits(credits) => {
                BatchOutcome::Written(self.writer.write_credits(&credits).await)
            }
        }
    }

    /// Read-side view of one address
    pub async fn query(&self, address: &str) -> Result<AddressPoints, StoreError> {
        let pool = self.writer.pool().get().await?;
        Ok(ledger::query_address(pool, address).await)
    }

    /// Close the pool if it was opened
    pub async fn shutdown(&self) {
        self.writer.pool().close().await;
    }
}
