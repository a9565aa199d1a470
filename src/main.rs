//! target-redshift: load tap messages from stdin into Amazon Redshift.
//!
//! Reads the line-delimited tap protocol on stdin, stages batches as
//! compressed CSV on S3, COPYs them into the warehouse, and echoes
//! STATE checkpoints on stdout once their records are durable. All
//! diagnostics go to stderr; stdout carries only the protocol.

use clap::Parser;
use snafu::prelude::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use target_redshift::config::Config;
use target_redshift::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, TargetError};
use target_redshift::target::run_target;

/// Exit code reported after a signal-driven shutdown.
const EXIT_INTERRUPTED: u8 = 130;

/// Tap-to-Redshift streaming loader.
#[derive(Parser, Debug)]
#[command(name = "target-redshift")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Address for the Prometheus metrics endpoint (disabled when
    /// unset).
    #[arg(long)]
    metrics_address: Option<String>,

    /// Dry run - validate configuration without processing.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // stdout is the STATE channel; logs go to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("target-redshift starting");

    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_interrupted() => {
            error!("Interrupted by signal");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            error!("{}", snafu::Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), TargetError> {
    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if let Some(address) = &args.metrics_address {
        let addr = address
            .parse()
            .context(AddressParseSnafu)
            .context(MetricsSnafu)?;
        target_redshift::metrics::init(addr).context(MetricsSnafu)?;
        debug!("Metrics endpoint listening on http://{}/metrics", address);
    }

    if args.dry_run {
        info!("Dry run mode - validating configuration");
        info!("Warehouse: {}:{}/{}", config.host, config.port, config.dbname);
        info!("Staging bucket: s3://{}", config.s3_bucket);
        info!("Target schemas: {}", config.target_schemas().join(", "));
        info!("Batch size: {} rows", config.batch_size_rows);
        info!("Configuration is valid");
        return Ok(());
    }

    let stats = run_target(config).await?;

    info!("Target completed successfully");
    info!("  Streams: {}", stats.streams);
    info!("  Records received: {}", stats.records_received);
    info!("  Batches flushed: {}", stats.batches_flushed);
    info!("  Rows loaded: {}", stats.rows_loaded);
    info!("  States emitted: {}", stats.states_emitted);

    Ok(())
}
