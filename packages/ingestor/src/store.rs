//! Ledger Store Connection
//!
//! Owns the connection pool to the ledger database. The pool is built lazily on
//! first use, checked with a ping, and then shared by every batch until the
//! handle is closed. A failed initialisation leaves nothing behind, so the next
//! caller tries again from scratch.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Connection;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info};

use crate::config::{ConfigError, StoreConfig};
use crate::ledger;

/// Errors that can occur while establishing the pool
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid store configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to ledger database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Ledger database did not answer ping: {0}")]
    Ping(#[source] sqlx::Error),

    #[error("Failed to create ledger schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("Ledger pool has been closed")]
    Closed,
}

impl StoreError {
    /// Short machine-readable name for result reporting
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Config(_) => "ConfigError",
            StoreError::CreateDir { .. } => "CreateDirError",
            StoreError::Connect(_) => "ConnectError",
            StoreError::Ping(_) => "PingError",
            StoreError::Schema(_) => "SchemaError",
            StoreError::Closed => "PoolClosed",
        }
    }
}

/// Lazily connected, shared pool handle
pub struct LedgerPool {
    config: StoreConfig,
    pool: OnceCell<SqlitePool>,
    init_attempts: AtomicU32,
    closed: AtomicBool,
}

impl LedgerPool {
    /// Create an unconnected handle; nothing touches the database yet
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            pool: OnceCell::new(),
            init_attempts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether a live pool is held
    pub fn is_initialized(&self) -> bool {
        self.pool.initialized()
    }

    /// Number of initialisation attempts so far, successful or not
    pub fn init_attempts(&self) -> u32 {
        self.init_attempts.load(Ordering::Relaxed)
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the pool, connecting on first use.
    ///
    /// Concurrent first callers share one initialisation attempt. After
    /// [`close`](Self::close) every call fails with [`StoreError::Closed`].
    pub async fn get(&self) -> Result<&SqlitePool, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        self.pool.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<SqlitePool, StoreError> {
        let attempt = self.init_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        match self.try_connect().await {
            Ok(pool) => Ok(pool),
            Err(e) => {
                error!("Failed to initialize ledger pool (attempt {}): {}", attempt, e);
                Err(e)
            }
        }
    }

    async fn try_connect(&self) -> Result<SqlitePool, StoreError> {
        self.config.validate()?;
        let path = self.config.resolved_path();

        if self.config.create_if_missing {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::CreateDir {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
        }

        info!("Connecting to ledger database at {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(self.config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(self.config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;

        // Never hand out a pool that failed its checks
        if let Err(e) = ping(&pool).await {
            pool.close().await;
            return Err(StoreError::Ping(e));
        }
        if self.config.bootstrap_schema {
            if let Err(e) = ledger::ensure_schema(&pool).await {
                pool.close().await;
                return Err(StoreError::Schema(e));
            }
        }

        info!(
            "Ledger pool ready (max {} connections)",
            self.config.max_connections
        );
        Ok(pool)
    }

    /// Close the pool if one was opened. The handle cannot be reused.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            info!("Ledger pool closed");
        }
    }
}

/// One trivial round-trip on a pooled connection
async fn ping(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}
