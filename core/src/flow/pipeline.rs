//! Raw cache output → batch of [`FlowRecord`]s for one monitor.

use tracing::debug;

use crate::config::MonitorSource;
use crate::errors::ParseError;

use super::metrics::derive_metrics;
use super::normalize::{normalize_rows, NormalizedRow};
use super::parser::parse_cache;
use super::temporal::{reconcile, ReconcileClock, Timezones};
use super::types::{FlowRecord, Timing};

/// Row-level counters for one processed cache dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Rows whose field count matched the header.
    pub rows_parsed: usize,
    /// Rows dropped for a field-count mismatch.
    pub malformed: usize,
    /// Rows dropped for a missing source/destination address.
    pub missing_identity: usize,
    /// Records stamped with the scrape time because timing was unusable.
    pub fallback_timing: usize,
    /// Records whose last-seen crossed midnight.
    pub rollovers: usize,
}

/// The records produced from one monitor's cache in one cycle.
#[derive(Debug, Clone)]
pub struct FlowBatch {
    pub monitor: MonitorSource,
    pub records: Vec<FlowRecord>,
    pub stats: PipelineStats,
}

/// Parse, normalize, reconcile and derive metrics for one cache dump.
///
/// Only a missing header is an error; every row-level problem is counted in
/// [`PipelineStats`] instead.
pub fn process_cache_output(
    output: &str,
    monitor: &MonitorSource,
    clock: &ReconcileClock,
    tz: &Timezones,
) -> Result<FlowBatch, ParseError> {
    let mut rows = parse_cache(output, monitor.name())?;
    let (normalized, norm_stats) = normalize_rows(rows.by_ref());

    let mut stats = PipelineStats {
        rows_parsed: norm_stats.accepted + norm_stats.missing_identity,
        malformed: rows.malformed(),
        missing_identity: norm_stats.missing_identity,
        ..Default::default()
    };

    let records: Vec<FlowRecord> = normalized
        .into_iter()
        .map(|row| build_record(row, monitor, clock, tz))
        .inspect(|record| match record.timing {
            Timing::Fallback => stats.fallback_timing += 1,
            Timing::Rollover => stats.rollovers += 1,
            Timing::Reconciled => {}
        })
        .collect();

    debug!(
        monitor = %monitor,
        records = records.len(),
        malformed = stats.malformed,
        missing_identity = stats.missing_identity,
        fallback_timing = stats.fallback_timing,
        "Processed flow cache"
    );

    Ok(FlowBatch {
        monitor: monitor.clone(),
        records,
        stats,
    })
}

fn build_record(
    row: NormalizedRow<'_>,
    monitor: &MonitorSource,
    clock: &ReconcileClock,
    tz: &Timezones,
) -> FlowRecord {
    let times = reconcile(row.time_first, row.time_last, clock, tz);
    let metrics = derive_metrics(times.first_seen, times.last_seen, row.in_bytes);

    FlowRecord {
        ipv4_src_addr: row.ipv4_src_addr,
        ipv4_dst_addr: row.ipv4_dst_addr,
        l4_src_port: row.l4_src_port,
        l4_dst_port: row.l4_dst_port,
        protocol: row.protocol,
        tcp_flags: row.tcp_flags,
        in_bytes: row.in_bytes,
        in_pkts: row.in_pkts,
        l7_proto: row.l7_proto,
        first_seen: times.first_seen,
        last_seen: times.last_seen,
        timing: times.timing,
        flow_monitor: monitor.name().to_string(),
        duration_ms: metrics.duration_ms,
        bytes_per_second: metrics.bytes_per_second,
        bits_per_second: metrics.bits_per_second,
        scrape_timestamp: times.last_seen,
    }
}
