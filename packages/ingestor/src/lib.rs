//! Points Ingestor Library
//!
//! This crate turns batches from a blockchain transaction stream into
//! per-platform point credits and accumulates them in a category-partitioned
//! SQLite ledger.

pub mod config;
pub mod credit;
pub mod decoder;
pub mod filter;
pub mod ledger;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod writer;

// Re-export commonly used types
pub use config::{IngestorConfig, StoreConfig, WriterConfig};
pub use credit::PointCredit;
pub use filter::{filter_batch, filter_transactions, FilterOutput};
pub use ledger::{query_address, AddressPoints, LedgerRow};
pub use pipeline::{BatchOutcome, Pipeline};
pub use registry::{Category, PlatformRegistry};
pub use store::LedgerPool;
pub use writer::{LedgerWriter, WriteReport};
