//! Configuration
//!
//! Typed settings for the store, the writer and the registry source, with
//! defaults sized for a single ingest process.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::registry::{PlatformRegistry, RegistryError};

/// Default ledger database location
pub const DEFAULT_DB_PATH: &str = "~/.points-ingestor/ledger.db";

/// Maximum pooled connections
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// How long a writer waits for a pooled connection
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 60_000;

/// How long a statement waits on a locked database before failing
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Errors in user-supplied configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Database path cannot be empty")]
    EmptyDbPath,

    #[error("max_connections must be at least 1")]
    ZeroConnections,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Connection-pool settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite ledger file; a leading `~/` is expanded
    pub db_path: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    /// Create the database file when it does not exist
    pub create_if_missing: bool,
    /// Create the ledger tables during pool initialisation
    pub bootstrap_schema: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            create_if_missing: true,
            bootstrap_schema: true,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the specified database path
    pub fn with_path(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Database path with `~` expanded
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.db_path))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.trim().is_empty() {
            return Err(ConfigError::EmptyDbPath);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.acquire_timeout_ms == 0 {
            warn!("acquire_timeout_ms is 0; every pool acquire will time out immediately");
        }
        Ok(())
    }
}

/// Ledger writer settings
#[derive(Debug, Clone, Default)]
pub struct WriterConfig {
    /// Skip credits whose transaction hash was already applied
    pub dedupe_by_tx_hash: bool,
}

/// Everything the ingest pipeline needs
#[derive(Debug, Clone, Default)]
pub struct IngestorConfig {
    pub store: StoreConfig,
    pub writer: WriterConfig,
    /// Registry document to load instead of the built-in one
    pub registry_path: Option<String>,
}

impl IngestorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()
    }

    /// Load the configured registry, or the built-in one
    pub fn load_registry(&self) -> Result<PlatformRegistry, ConfigError> {
        match &self.registry_path {
            Some(path) => Ok(PlatformRegistry::load(expand_path(path))?),
            None => Ok(PlatformRegistry::builtin().clone()),
        }
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
