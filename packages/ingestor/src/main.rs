use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use points_ingestor::config::{
    IngestorConfig, StoreConfig, WriterConfig, DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_DB_PATH,
    DEFAULT_MAX_CONNECTIONS,
};
use points_ingestor::Pipeline;

/// Filter transaction stream batches into platform points and keep the ledger
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Path to the SQLite ledger
    #[arg(long, env = "POINTS_DB_PATH", default_value = DEFAULT_DB_PATH, global = true)]
    db_path: String,

    /// Platform registry JSON to use instead of the built-in one
    #[arg(long, env = "POINTS_REGISTRY", global = true)]
    registry: Option<String>,

    #[arg(long, env = "POINTS_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS, global = true)]
    max_connections: u32,

    #[arg(long, env = "POINTS_ACQUIRE_TIMEOUT_MS", default_value_t = DEFAULT_ACQUIRE_TIMEOUT_MS, global = true)]
    acquire_timeout_ms: u64,

    /// Credit each transaction hash at most once
    #[arg(long, env = "POINTS_DEDUPE", global = true)]
    dedupe_by_tx_hash: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Filter stream batches (one JSON document per line) and write their credits
    Ingest { input: Option<PathBuf> },
    /// Only filter stream batches and print the handoff
    Filter { input: Option<PathBuf> },
    /// Apply writer invocations of the form {"points": [...]}
    Write { input: Option<PathBuf> },
    /// Print every ledger row for an address
    Query { address: String },
}

impl Args {
    fn ingestor_config(&self) -> IngestorConfig {
        IngestorConfig {
            store: StoreConfig {
                max_connections: self.max_connections,
                acquire_timeout_ms: self.acquire_timeout_ms,
                ..StoreConfig::with_path(self.db_path.clone())
            },
            writer: WriterConfig {
                dedupe_by_tx_hash: self.dedupe_by_tx_hash,
            },
            registry_path: self.registry.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries results, logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("points_ingestor=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let pipeline = Pipeline::from_config(&args.ingestor_config())
        .context("Failed to build ingest pipeline")?;
    info!(
        "Loaded registry with {} platform contracts",
        pipeline.registry().len()
    );

    let result = run(&pipeline, args.command).await;
    pipeline.shutdown().await;
    result
}

async fn run(pipeline: &Pipeline, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ingest { input } => {
            for_each_line(input, |doc| async move { pipeline.process(&doc).await.to_json() }).await
        }
        Command::Filter { input } => {
            for_each_line(input, |doc| async move { pipeline.filter(&doc).to_json() }).await
        }
        Command::Write { input } => {
            for_each_line(input, |doc| async move {
                pipeline.writer().write_handoff(&doc).await.to_json()
            })
            .await
        }
        Command::Query { address } => {
            let points = pipeline
                .query(&address)
                .await
                .context("Failed to open ledger")?;
            println!("{}", serde_json::to_string_pretty(&points)?);
            Ok(())
        }
    }
}

/// Feed every non-blank JSON line of the input to `handle` and print each result.
///
/// Stops at end of input or on Ctrl-C.
async fn for_each_line<F, Fut>(input: Option<PathBuf>, mut handle: F) -> anyhow::Result<()>
where
    F: FnMut(Value) -> Fut,
    Fut: std::future::Future<Output = Value>,
{
    let reader: Box<dyn AsyncRead + Unpin + Send> = match &input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(reader).lines();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut line_no = 0usize;
    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping after {} lines", line_no);
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<Value>(&line) {
            Ok(doc) => handle(doc).await,
            Err(e) => {
                warn!("Line {} is not valid JSON: {}", line_no, e);
                json!({ "error": format!("line {}: {}", line_no, e) })
            }
        };
        println!("{}", serde_json::to_string(&output)?);
    }

    Ok(())
}
