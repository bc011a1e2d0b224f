//! dockside: load new bike-station snapshots from the lake into Delta Lake.
//!
//! Runs once by default. With `poll_interval_secs` set in the configuration
//! it keeps running on that interval until SIGINT, SIGTERM or SIGQUIT.

use clap::{Parser, Subcommand};
use serde::Serialize;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use dockside::config::Config;
use dockside::dlq::DeadLetterQueue;
use dockside::error::{
    AddressParseSnafu, ConfigSnafu, DlqSnafu, FilesFailedSnafu, MetricsSnafu, PipelineError,
    RunSnafu, SummaryJsonSnafu, WarehouseSnafu,
};
use dockside::pipeline::{Coordinator, RunSummary, run_all, table_name};
use dockside::polling::{IterationResult, run_polling_loop};
use dockside::sink::DeltaSnapshotTable;
use dockside::{metrics, signal};

/// Incremental snapshot loader for Delta Lake.
#[derive(Parser, Debug)]
#[command(name = "dockside")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Resolve watermarks and print what would be loaded, without loading.
    #[arg(long)]
    dry_run: bool,

    /// Print run summaries as JSON on stdout.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Load new snapshots (the default).
    Run,
    /// Create any missing target tables with the expected schema.
    Provision,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let args = Args::parse();

    // Logs go to stderr so --json output stays parseable
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("dockside starting");

    let config = Config::from_file(&args.config).context(ConfigSnafu)?;

    if args.command == Some(Command::Provision) {
        return provision(&config).await;
    }

    let shutdown = CancellationToken::new();
    signal::cancel_on_signal(&shutdown);

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr, shutdown.clone()).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let dlq = DeadLetterQueue::from_config(&config.error_handling)
        .await
        .context(DlqSnafu)?
        .map(Arc::new);

    let mut coordinators = Vec::with_capacity(config.feeds.len());
    for (name, feed) in &config.feeds {
        coordinators.push(Coordinator::from_config(name, feed, &config, dlq.clone()).await?);
    }

    let result = if args.dry_run {
        dry_run(&coordinators, args.json).await
    } else if let Some(poll_interval) = config.poll_interval() {
        let (coordinators, shutdown_ref, json) = (&coordinators, &shutdown, args.json);
        run_polling_loop(
            move || async move { watch_iteration(coordinators, shutdown_ref, json).await },
            poll_interval,
            config.poll_jitter_secs,
            shutdown.clone(),
            "dockside",
        )
        .await;
        Ok(())
    } else {
        run_once(&coordinators, &shutdown, args.json).await
    };

    // Stops the metrics server
    shutdown.cancel();
    result
}

async fn provision(config: &Config) -> Result<(), PipelineError> {
    for (name, feed) in &config.feeds {
        let table = DeltaSnapshotTable::provision(
            table_name(&feed.table_uri),
            feed.kind,
            &feed.table_uri,
            feed.storage_options.clone(),
        )
        .await
        .context(WarehouseSnafu)?;
        info!(
            target = %name,
            "Table {} ready at version {}",
            feed.table_uri,
            table.version().await
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(value).context(SummaryJsonSnafu)?;
    println!("{json}");
    Ok(())
}

async fn dry_run(coordinators: &[Coordinator], json: bool) -> Result<(), PipelineError> {
    let mut plans = Vec::with_capacity(coordinators.len());
    for coordinator in coordinators {
        let plan = coordinator.plan().await.context(RunSnafu {
            feed: coordinator.feed(),
        })?;
        info!(
            target = %plan.feed,
            "Dry run: {} committed, {} would load",
            plan.committed,
            plan.pending.len()
        );
        for object in &plan.pending {
            info!(target = %plan.feed, "  {} ({})", object.location, object.timestamp);
        }
        plans.push(plan);
    }

    if json {
        print_json(&plans)?;
    }
    Ok(())
}

async fn run_once(
    coordinators: &[Coordinator],
    shutdown: &CancellationToken,
    json: bool,
) -> Result<(), PipelineError> {
    let (summaries, aborted) = run_all(coordinators, shutdown).await;

    if json {
        print_json(&summaries)?;
    }

    if let Some((feed, source)) = aborted.into_iter().next() {
        return Err(PipelineError::Run { feed, source });
    }

    let failed: usize = summaries.iter().map(|s| s.failed).sum();
    ensure!(failed == 0, FilesFailedSnafu { count: failed });
    Ok(())
}

async fn watch_iteration(
    coordinators: &[Coordinator],
    shutdown: &CancellationToken,
    json: bool,
) -> IterationResult {
    let (summaries, _aborted) = run_all(coordinators, shutdown).await;

    if json && let Err(e) = print_json(&summaries) {
        error!("Failed to print run summaries: {}", e);
    }

    if shutdown.is_cancelled() {
        IterationResult::Shutdown
    } else if summaries.iter().any(|s: &RunSummary| s.loaded > 0) {
        IterationResult::ProcessedItems
    } else {
        IterationResult::NoItems
    }
}
