//! Flow record types.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// How a record's first/last-seen timestamps were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    /// Reconciled from the cache's time-of-day columns.
    Reconciled,
    /// Reconciled, and the last-seen time crossed midnight.
    Rollover,
    /// Time columns absent or unparsable; both timestamps are the scrape
    /// time. Duration 0 here means "unknown", not "instantaneous".
    Fallback,
}

/// A normalized flow with reconciled timestamps and derived metrics.
///
/// `None` in a numeric field is the "missing" marker: the cell was absent
/// or could not be coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub ipv4_src_addr: String,
    pub ipv4_dst_addr: String,
    pub l4_src_port: Option<u16>,
    pub l4_dst_port: Option<u16>,
    pub protocol: Option<u8>,
    pub tcp_flags: Option<u32>,
    pub in_bytes: Option<u64>,
    pub in_pkts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l7_proto: Option<String>,
    pub first_seen: DateTime<FixedOffset>,
    pub last_seen: DateTime<FixedOffset>,
    pub timing: Timing,
    pub flow_monitor: String,
    pub duration_ms: i64,
    pub bytes_per_second: Option<f64>,
    pub bits_per_second: Option<f64>,
    pub scrape_timestamp: DateTime<FixedOffset>,
}

/// One row of the store schema. The fallback log carries the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRow {
    pub ipv4_src_addr: String,
    pub ipv4_dst_addr: String,
    pub l4_src_port: Option<u16>,
    pub l4_dst_port: Option<u16>,
    pub protocol: Option<u8>,
    pub tcp_flags: Option<u32>,
    pub in_bytes: Option<u64>,
    pub in_pkts: Option<u64>,
    pub flow_duration_ms: i64,
    pub bytes_per_second: Option<f64>,
    pub avg_throughput_bps: Option<f64>,
    pub flow_monitor: String,
    pub time: DateTime<FixedOffset>,
}

/// Store column names, in insert order.
pub const FLOW_ROW_COLUMNS: [&str; 13] = [
    "ipv4_src_addr",
    "ipv4_dst_addr",
    "l4_src_port",
    "l4_dst_port",
    "protocol",
    "tcp_flags",
    "in_bytes",
    "in_pkts",
    "flow_duration_ms",
    "bytes_per_second",
    "avg_throughput_bps",
    "flow_monitor",
    "time",
];

impl From<&FlowRecord> for FlowRow {
    fn from(r: &FlowRecord) -> Self {
        Self {
            ipv4_src_addr: r.ipv4_src_addr.clone(),
            ipv4_dst_addr: r.ipv4_dst_addr.clone(),
            l4_src_port: r.l4_src_port,
            l4_dst_port: r.l4_dst_port,
            protocol: r.protocol,
            tcp_flags: r.tcp_flags,
            in_bytes: r.in_bytes,
            in_pkts: r.in_pkts,
            flow_duration_ms: r.duration_ms,
            bytes_per_second: r.bytes_per_second,
            avg_throughput_bps: r.bits_per_second,
            flow_monitor: r.flow_monitor.clone(),
            time: r.scrape_timestamp,
        }
    }
}

impl From<FlowRecord> for FlowRow {
    fn from(r: FlowRecord) -> Self {
        Self::from(&r)
    }
}
