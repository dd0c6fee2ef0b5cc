//! chute - stream keyed records into ClickHouse
//!
//! # Usage
//!
//! ```bash
//! # Run the demo pipeline: 3 random metric sources merged into one table
//! chute -c sink.yaml run --sources 3
//!
//! # Validate configuration and the table schema without connecting
//! chute -c sink.yaml validate
//!
//! # Print the JSON schema of the configuration file
//! chute schema
//! ```

use anyhow::{Context, Result};
use chute_clickhouse::datagen::{self, DEFAULT_INTERVAL};
use chute_clickhouse::telemetry::{init_logging, LogConfig, LogFormat};
use chute_clickhouse::{pipeline, ClickHouseSink, SinkConfig, TableDescriptor};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, info_span, warn};

#[derive(Parser)]
#[command(name = "chute")]
#[command(version, about = "Batching ClickHouse sink for keyed record streams")]
struct Cli {
    /// Path to the sink configuration file
    #[arg(short, long, default_value = "sink.yaml", env = "CHUTE_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = Format::Text)]
    log_format: Format,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo metric pipeline into the configured table (default)
    Run {
        /// Number of metric sources merged into the stream
        #[arg(long, default_value_t = 3)]
        sources: usize,

        /// Milliseconds between rows of one source
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many rows per source
        #[arg(long)]
        limit: Option<usize>,

        /// Parallel workers, each with its own connection
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Validate the configuration and table schema
    Validate,
    /// Print the configuration JSON schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = match cli.log_format {
        Format::Text => LogFormat::Text,
        Format::Json => LogFormat::Json,
    };
    init_logging(&LogConfig::default().verbose(cli.verbose).with_format(format))?;

    if let Some(Commands::Schema) = &cli.command {
        let schema = SinkConfig::json_schema();
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = SinkConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run {
        sources: 3,
        interval_ms: None,
        limit: None,
        workers: 1,
    }) {
        Commands::Run {
            sources,
            interval_ms,
            limit,
            workers,
        } => {
            let interval = interval_ms.map(Duration::from_millis).unwrap_or(DEFAULT_INTERVAL);
            run_demo(config, sources, interval, limit, workers).await
        }
        Commands::Validate => validate_config(&config),
        Commands::Schema => unreachable!(), // handled above
    }
}

fn validate_config(config: &SinkConfig) -> Result<()> {
    let descriptor = TableDescriptor::from_config(config)?;
    info!(
        table = %config.connection.qualified_table(descriptor.name()),
        columns = descriptor.columns().len(),
        order_by = ?descriptor.order_by(),
        "Configuration is valid"
    );
    if descriptor.has_columns() {
        descriptor.record_schema()?;
        if descriptor.ensure_creatable().is_ok() {
            println!("{}", descriptor.create_statement(config.connection.database())?);
        }
    }
    Ok(())
}

async fn run_demo(
    mut config: SinkConfig,
    sources: usize,
    interval: Duration,
    limit: Option<usize>,
    workers: usize,
) -> Result<()> {
    if config.schema.is_none() {
        warn!("No schema configured, using the demo metrics table definition");
        config.schema = Some(datagen::METRICS_DDL.to_string());
        config.order_by = Some(datagen::METRICS_ORDER_BY.to_string());
    }
    let policy = config.batch;

    let span = info_span!("chute", table = %config.table);
    let sink = ClickHouseSink::builder(config)
        .span(span)
        .build()
        .await
        .context("Failed to set up the ClickHouse sink")?;
    let schema = sink.record_schema()?;

    info!(sources, workers, ?interval, "Starting demo pipeline");
    let records = datagen::metric_stream(sources, interval, limit).take_until(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C), draining buffered records");
        }
    });

    let stats = pipeline::output(&sink, schema, records, policy, workers).await?;
    info!(
        batches = stats.batches,
        records = stats.records,
        "Pipeline finished"
    );
    Ok(())
}
