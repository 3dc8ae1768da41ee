//! # Chronicle CLI
//!
//! Runs a storage node and offers a few admin commands against a database
//! directory: stats, scavenge, offline verification and simple reads and
//! appends.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use chronicle_core::{
    config::{LogFormat, LoggingConfig, NodeConfig},
    ExpectedVersion, NewEvent, ReadStreamResult, RecordedEvent,
};
use chronicle_storage::{chunk::verify_chunks, StorageEngine};

#[derive(Parser)]
#[command(name = "chronicle")]
#[command(about = "Chronicle - append-only event store node")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database directory, overrides `db.path`
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the database and serve until Ctrl-C
    Run,
    /// Print storage statistics as JSON
    Stats,
    /// Run one scavenge pass to completion
    Scavenge,
    /// Check every chunk checksum and record without starting the node
    Verify,
    /// Read events from a stream
    Read {
        stream: String,
        #[arg(long, default_value_t = 0)]
        from: i32,
        #[arg(long, default_value_t = 20)]
        count: usize,
        /// Read towards the start of the stream; `--from -1` starts at the end
        #[arg(long)]
        backward: bool,
    },
    /// Append one event to a stream
    Append {
        stream: String,
        event_type: String,
        data: String,
        /// Expected version: `any`, `no-stream` or an event number
        #[arg(long, default_value = "any")]
        expected: String,
        /// Mark the payload as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a tombstone for a stream
    Delete {
        stream: String,
        #[arg(long, default_value = "any")]
        expected: String,
    },
}

fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db.path = db.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_expected(raw: &str) -> Result<ExpectedVersion> {
    match raw {
        "any" => Ok(ExpectedVersion::Any),
        "no-stream" => Ok(ExpectedVersion::NoStream),
        n => {
            let number: i32 = n.parse().with_context(|| format!("invalid expected version '{}'", n))?;
            if number < 0 {
                bail!("expected version must be any, no-stream or a non-negative number");
            }
            Ok(ExpectedVersion::Exact(number))
        }
    }
}

fn event_json(event: &RecordedEvent) -> serde_json::Value {
    json!({
        "stream": event.stream_id,
        "number": event.event_number,
        "id": event.event_id,
        "type": event.event_type,
        "data": String::from_utf8_lossy(&event.data),
        "position": event.log_position,
        "timestamp": event.timestamp,
    })
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging);

    if let Commands::Verify = cli.command {
        return verify(config);
    }

    let engine = StorageEngine::open(config).await.context("opening database")?;
    let outcome = execute(&engine, cli.command).await;
    engine.shutdown().await?;
    outcome
}

async fn execute(engine: &StorageEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Run => {
            info!(
                writer_checkpoint = engine.writer_checkpoint(),
                chaser_checkpoint = engine.chaser_checkpoint(),
                "Chronicle node running, press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await?;
        }
        Commands::Stats => {
            print_json(&serde_json::to_value(engine.get_stats())?)?;
        }
        Commands::Scavenge => match engine.scavenge().await? {
            Some(result) => print_json(&serde_json::to_value(result)?)?,
            None => bail!("a scavenge pass is already running"),
        },
        Commands::Read { stream, from, count, backward } => {
            let result = if backward {
                engine.read_stream_backward(&stream, from, count)?
            } else {
                engine.read_stream_forward(&stream, from, count)?
            };
            match result {
                ReadStreamResult::Success(slice) => {
                    let events: Vec<_> = slice.events.iter().map(event_json).collect();
                    print_json(&json!({
                        "events": events,
                        "next_event_number": slice.next_event_number,
                        "last_event_number": slice.last_event_number,
                        "is_end_of_stream": slice.is_end_of_stream,
                    }))?;
                }
                ReadStreamResult::NoStream => println!("stream '{}' does not exist", stream),
                ReadStreamResult::StreamDeleted => println!("stream '{}' is deleted", stream),
            }
        }
        Commands::Append { stream, event_type, data, expected, json } => {
            let event = if json {
                NewEvent::json(event_type, Bytes::from(data))
            } else {
                NewEvent::new(event_type, Bytes::from(data))
            };
            let result = engine
                .write_events(&stream, parse_expected(&expected)?, vec![event])
                .await?;
            print_json(&serde_json::to_value(result)?)?;
        }
        Commands::Delete { stream, expected } => {
            let result = engine.delete_stream(&stream, parse_expected(&expected)?).await?;
            print_json(&serde_json::to_value(result)?)?;
        }
        Commands::Verify => bail!("verify runs against a closed database"),
    }
    Ok(())
}

/// Open the log with full checksum verification and decode every record.
fn verify(config: NodeConfig) -> Result<()> {
    let report = verify_chunks(&config.db).context("verifying chunks")?;
    print_json(&json!({
        "chunks": report.chunks.len(),
        "completed_chunks": report.chunks.iter().filter(|c| c.completed).count(),
        "records": report.records(),
        "end_position": report.end_position,
        "torn_bytes": report.torn_bytes(),
        "stale_scavenge_files": report.stale_scavenge_files,
    }))?;
    if report.torn_bytes() > 0 {
        warn!(torn_bytes = report.torn_bytes(), "Torn tail found, it is cut off the next time the database opens");
    }
    Ok(())
}
