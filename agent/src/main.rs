mod settings;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowtap_core::config::{MonitorSource, TimezoneConfig};
use flowtap_core::device::ssh::SshConnector;
use flowtap_core::flow::{process_cache_output, FlowRow, ReconcileClock};
use flowtap_core::poll::PollScheduler;
use flowtap_core::sink::{FallbackLog, FlowStore, IngestionSink, MemoryStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::store::PgStore;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "flowtap", version, about = "Poll router flow-monitor caches into a time-series store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the configured monitors until SIGINT/SIGTERM.
    Run {
        /// JSON config file (default: environment variables).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
        /// Keep rows in memory instead of writing to the store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-deliver the fallback log to the store.
    Redeliver {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Fallback log to re-deliver (default: the configured one).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Parse a saved cache dump and print its rows as JSON Lines.
    Parse {
        file: PathBuf,
        #[arg(long)]
        monitor: String,
        /// Device clock zone, e.g. `+04:00` or `Asia/Dubai`.
        #[arg(long, default_value = "UTC")]
        device_tz: String,
        /// Zone of the printed timestamps.
        #[arg(long, default_value = "UTC")]
        canonical_tz: String,
    },
    /// Create the flow table if it does not exist.
    InitSchema {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `parse` output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            config,
            once,
            dry_run,
        } => run(config, once, dry_run).await,
        Command::Redeliver { config, log } => redeliver(config, log).await,
        Command::Parse {
            file,
            monitor,
            device_tz,
            canonical_tz,
        } => parse(file, monitor, device_tz, canonical_tz),
        Command::InitSchema { config } => {
            let config = settings::load(config.as_deref())?;
            PgStore::connect_lazy(&config.store)?
                .ensure_schema()
                .await
                .context("Failed to create flow table")
        }
    }
}

async fn run(config: Option<PathBuf>, once: bool, dry_run: bool) -> anyhow::Result<()> {
    let config = settings::load(config.as_deref())?;
    info!("flowtap {} starting", VERSION);

    let store: Arc<dyn FlowStore> = if dry_run {
        warn!("Dry run: rows are kept in memory and discarded on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::connect_lazy(&config.store)?)
    };
    let sink = Arc::new(IngestionSink::new(
        store,
        FallbackLog::new(&config.fallback_log),
        Duration::from_millis(config.store.write_timeout_ms),
    ));
    let connector = Arc::new(SshConnector::new(config.device.clone())?);
    let scheduler = PollScheduler::new(&config, connector, sink)?;

    let cancel = CancellationToken::new();
    if once {
        scheduler.run_cycle(1, &cancel).await;
        return Ok(());
    }

    tokio::spawn(shutdown_on_signal(cancel.clone()));
    scheduler.run(cancel).await;
    Ok(())
}

async fn redeliver(config: Option<PathBuf>, log: Option<PathBuf>) -> anyhow::Result<()> {
    let config = settings::load(config.as_deref())?;
    let log = log.unwrap_or_else(|| PathBuf::from(&config.fallback_log));
    let sink = IngestionSink::new(
        Arc::new(PgStore::connect_lazy(&config.store)?),
        FallbackLog::new(log),
        Duration::from_millis(config.store.write_timeout_ms),
    );

    let report = sink.redeliver().await?;
    if !report.rejected.is_empty() {
        warn!(
            "Store rejected {} row(s) of the log (indices {:?})",
            report.rejected.len(),
            report.rejected
        );
    }
    if !report.corrupt_lines.is_empty() {
        warn!(
            "Skipped {} corrupt line(s): {:?}",
            report.corrupt_lines.len(),
            report.corrupt_lines
        );
    }
    info!("Re-delivered {} row(s)", report.delivered);
    Ok(())
}

fn parse(
    file: PathBuf,
    monitor: String,
    device_tz: String,
    canonical_tz: String,
) -> anyhow::Result<()> {
    let output = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let timezones = TimezoneConfig {
        device: device_tz,
        reference: None,
        canonical: canonical_tz,
    }
    .resolve()?;

    let monitor = MonitorSource::new(monitor);
    let batch = process_cache_output(
        &output,
        &monitor,
        &ReconcileClock::now(&timezones),
        &timezones,
    )?;

    let mut stdout = std::io::stdout().lock();
    for record in &batch.records {
        serde_json::to_writer(&mut stdout, &FlowRow::from(record))?;
        std::io::Write::write_all(&mut stdout, b"\n")?;
    }
    info!(
        records = batch.records.len(),
        malformed = batch.stats.malformed,
        missing_identity = batch.stats.missing_identity,
        fallback_timing = batch.stats.fallback_timing,
        "Parsed {}",
        file.display()
    );
    Ok(())
}

/// Cancel `token` on SIGINT, or SIGTERM on Unix.
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {e}");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();

    info!("Shutdown signal received, stopping after the current monitor");
    token.cancel();
}
