//! Rivven Pre-Transform CLI
//!
//! Validates rule files and runs JSON Lines event streams through the
//! pre-transform engine.
//!
//! ## Usage
//!
//! ```bash
//! # Check a rule file
//! rivven-transform validate --config rules.yaml
//!
//! # Transform events from a file (stdin when --input is omitted)
//! rivven-transform run --config rules.yaml --input events.jsonl > reduced.jsonl
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use rivven_transform::{Event, PreTransformEngine, TransformConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rivven-transform")]
#[command(
    author,
    version,
    about = "Rivven Pre-Transform - schema-aware column projection for CDC streams"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a rule file
    Validate {
        /// Rule file (YAML)
        #[arg(short, long, env = "RIVVEN_TRANSFORM_CONFIG")]
        config: PathBuf,
    },

    /// Transform a JSON Lines event stream
    Run {
        /// Rule file (YAML)
        #[arg(short, long, env = "RIVVEN_TRANSFORM_CONFIG")]
        config: PathBuf,

        /// Input file, one event per line (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Bound of the channels between reader, engine and writer
        #[arg(long, default_value = "1024")]
        channel_capacity: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries events, so logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Run {
            config,
            input,
            channel_capacity,
        } => run(&config, input.as_deref(), channel_capacity).await,
    }
}

fn load(path: &Path) -> anyhow::Result<TransformConfig> {
    TransformConfig::from_file(path)
        .with_context(|| format!("Invalid rule file {}", path.display()))
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    println!(
        "✓ {} is valid: {} rule(s), {} UDF(s)",
        path.display(),
        config.transforms.len(),
        config.udfs.len()
    );
    for (index, rule) in config.transforms.iter().enumerate() {
        println!(
            "  #{} {} projection: {} filter: {}",
            index + 1,
            rule.source_table,
            rule.projection.as_deref().unwrap_or("*"),
            rule.filter.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run(path: &Path, input: Option<&Path>, channel_capacity: usize) -> anyhow::Result<()> {
    let config = load(path)?;
    let engine = Arc::new(PreTransformEngine::new(config)?);

    let (in_tx, in_rx) = mpsc::channel::<Event>(channel_capacity.max(1));
    let (out_tx, mut out_rx) = mpsc::channel::<Event>(channel_capacity.max(1));

    let worker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(in_rx, out_tx).await })
    };

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = out_rx.recv().await {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
        }
        stdout.flush().await?;
        Ok::<_, anyhow::Error>(())
    });

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(file) => Box::new(BufReader::new(
            tokio::fs::File::open(file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut lines = reader.lines();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .with_context(|| format!("Invalid event on line {}", line_number))?;
        if in_tx.send(event).await.is_err() {
            // engine task stopped; its error is reported below
            break;
        }
    }
    drop(in_tx);

    let forwarded = worker.await??;
    writer.await??;

    let stats = engine.stats();
    info!(
        forwarded,
        schema_events = stats.schema_events,
        data_events = stats.data_events,
        control_events = stats.control_events,
        "Pre-transform finished"
    );
    engine.shutdown();
    Ok(())
}
