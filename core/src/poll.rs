//! Poll scheduler.
//!
//! Runs an unbounded sequence of poll cycles separated by a fixed interval.
//! Within a cycle the configured monitors are dealt round-robin to up to
//! `workers` slots. Each slot owns at most one device session, opened lazily
//! on its first monitor and dropped (closed) at the end of the cycle or as
//! soon as a command on it fails. A failure on one monitor is logged and the
//! slot moves on to its next monitor with a fresh session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CollectorConfig, MonitorSource};
use crate::device::{DeviceConnector, DeviceSession};
use crate::errors::{CoreError, SessionError};
use crate::flow::{process_cache_output, PipelineStats, ReconcileClock, Timezones};
use crate::sink::{IngestOutcome, IngestionSink};

/// Totals for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub monitors_ok: usize,
    pub monitors_failed: usize,
    /// Monitors not started because the stop signal arrived mid-cycle.
    pub monitors_skipped: usize,
    pub records_stored: usize,
    pub records_rejected: usize,
    pub records_fallback: usize,
    /// Rows the fallback log could not take either.
    pub records_lost: usize,
    /// Rows dropped by the parser or normalizer.
    pub rows_dropped: usize,
    pub fallback_timing: usize,
}

impl CycleReport {
    fn absorb(&mut self, result: MonitorResult) {
        match result {
            MonitorResult::Skipped => self.monitors_skipped += 1,
            MonitorResult::Failed => self.monitors_failed += 1,
            MonitorResult::Ingested { stats, outcome } => {
                self.rows_dropped += stats.malformed + stats.missing_identity;
                self.fallback_timing += stats.fallback_timing;
                match outcome {
                    Ok(IngestOutcome::Empty) => {}
                    Ok(IngestOutcome::Stored { rows }) => self.records_stored += rows,
                    Ok(IngestOutcome::PartiallyRejected { accepted, rejected }) => {
                        self.records_stored += accepted;
                        self.records_rejected += rejected.len();
                    }
                    Ok(IngestOutcome::FellBack { rows }) => self.records_fallback += rows,
                    Err(lost) => {
                        self.records_lost += lost;
                        self.monitors_failed += 1;
                        return;
                    }
                }
                self.monitors_ok += 1;
            }
        }
    }
}

enum MonitorResult {
    Ingested {
        stats: PipelineStats,
        /// `Err` carries the number of rows lost.
        outcome: Result<IngestOutcome, usize>,
    },
    Failed,
    Skipped,
}

/// State shared by every worker slot of a cycle.
#[derive(Clone)]
struct SlotContext {
    connector: Arc<dyn DeviceConnector>,
    sink: Arc<IngestionSink>,
    timezones: Timezones,
    cycle: u64,
}

pub struct PollScheduler {
    connector: Arc<dyn DeviceConnector>,
    sink: Arc<IngestionSink>,
    monitors: Vec<MonitorSource>,
    timezones: Timezones,
    interval: Duration,
    workers: usize,
}

impl PollScheduler {
    pub fn new(
        config: &CollectorConfig,
        connector: Arc<dyn DeviceConnector>,
        sink: Arc<IngestionSink>,
    ) -> Result<Self, CoreError> {
        let monitors = config.monitor_sources();
        if monitors.is_empty() {
            return Err(CoreError::Config("No flow monitors configured".into()));
        }
        Ok(Self {
            connector,
            sink,
            monitors,
            timezones: config.timezones.resolve()?,
            interval: config.poll_interval(),
            workers: config.workers.max(1),
        })
    }

    pub fn monitors(&self) -> &[MonitorSource] {
        &self.monitors
    }

    /// Run cycles until `cancel` fires. Returns the number of cycles run.
    ///
    /// Cancellation interrupts the sleep between cycles immediately. A cycle
    /// in flight finishes the monitors it already started and skips the rest.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        info!(
            "Polling {} monitor(s) on {} every {}s with {} worker(s)",
            self.monitors.len(),
            self.connector.describe(),
            self.interval.as_secs(),
            self.workers
        );

        let mut cycle = 0u64;
        while !cancel.is_cancelled() {
            cycle += 1;
            self.run_cycle(cycle, &cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Poll scheduler stopped after {cycle} cycle(s)");
        cycle
    }

    /// Run one cycle over every monitor and wait for all slots to finish.
    pub async fn run_cycle(&self, cycle: u64, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let ctx = SlotContext {
            connector: self.connector.clone(),
            sink: self.sink.clone(),
            timezones: self.timezones,
            cycle,
        };

        let mut slots = JoinSet::new();
        for assigned in deal(&self.monitors, self.workers) {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            slots.spawn(async move { run_slot(ctx, assigned, cancel).await });
        }

        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };
        while let Some(joined) = slots.join_next().await {
            match joined {
                Ok(results) => results.into_iter().for_each(|r| report.absorb(r)),
                Err(e) => error!(cycle, "Worker slot panicked: {e}"),
            }
        }

        info!(
            cycle,
            ok = report.monitors_ok,
            failed = report.monitors_failed,
            skipped = report.monitors_skipped,
            stored = report.records_stored,
            rejected = report.records_rejected,
            fallback = report.records_fallback,
            lost = report.records_lost,
            dropped = report.rows_dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Poll cycle complete"
        );
        report
    }
}

/// Split `monitors` round-robin over at most `workers` slots.
fn deal(monitors: &[MonitorSource], workers: usize) -> Vec<Vec<MonitorSource>> {
    let slots = workers.clamp(1, monitors.len().max(1));
    let mut assigned = vec![Vec::new(); slots];
    for (idx, monitor) in monitors.iter().enumerate() {
        assigned[idx % slots].push(monitor.clone());
    }
    assigned.retain(|m| !m.is_empty());
    assigned
}

async fn run_slot(
    ctx: SlotContext,
    monitors: Vec<MonitorSource>,
    cancel: CancellationToken,
) -> Vec<MonitorResult> {
    let mut session: Option<Box<dyn DeviceSession>> = None;
    let mut results = Vec::with_capacity(monitors.len());

    for monitor in monitors {
        if cancel.is_cancelled() {
            debug!(cycle = ctx.cycle, monitor = %monitor, "Stop requested, skipping monitor");
            results.push(MonitorResult::Skipped);
            continue;
        }

        let command = ctx.connector.cache_command(&monitor);
        let (returned, fetched) = fetch(ctx.connector.clone(), session.take(), command).await;
        session = returned;

        let output = match fetched {
            Ok(output) => output,
            Err(e) => {
                warn!(cycle = ctx.cycle, monitor = %monitor, "Fetch failed: {e}");
                results.push(MonitorResult::Failed);
                continue;
            }
        };

        let clock = ReconcileClock::now(&ctx.timezones);
        let batch = match process_cache_output(&output, &monitor, &clock, &ctx.timezones) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(cycle = ctx.cycle, monitor = %monitor, "{e}");
                results.push(MonitorResult::Failed);
                continue;
            }
        };

        let rows = batch.records.len();
        let outcome = ctx
            .sink
            .ingest(&batch.monitor, batch.records)
            .await
            .map_err(|_| rows);
        results.push(MonitorResult::Ingested {
            stats: batch.stats,
            outcome,
        });
    }

    // Dropping the session here closes it before the cycle is reported.
    drop(session);
    results
}

/// Run one cache command on the blocking pool, opening a session first if
/// the slot has none. A session whose command failed is not handed back.
///
/// Some devices close the connection after the first command, so a failure
/// on a session carried over from an earlier monitor is retried once on a
/// fresh session.
async fn fetch(
    connector: Arc<dyn DeviceConnector>,
    session: Option<Box<dyn DeviceSession>>,
    command: String,
) -> (Option<Box<dyn DeviceSession>>, Result<String, SessionError>) {
    let joined = tokio::task::spawn_blocking(move || {
        if let Some(mut reused) = session {
            match reused.run_command(&command) {
                Ok(output) => return (Some(reused), Ok(output)),
                Err(e) => debug!("Reused session failed ({e}), reconnecting"),
            }
        }
        let mut session = match connector.open() {
            Ok(session) => session,
            Err(e) => return (None, Err(e)),
        };
        match session.run_command(&command) {
            Ok(output) => (Some(session), Ok(output)),
            Err(e) => (None, Err(e)),
        }
    })
    .await;

    joined.unwrap_or_else(|e| {
        (
            None,
            Err(SessionError::DeviceUnreachable(format!(
                "session task panicked: {e}"
            ))),
        )
    })
}
