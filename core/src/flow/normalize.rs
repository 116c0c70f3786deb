//! Map vendor column names to canonical fields and coerce cell types.

use std::str::FromStr;

use tracing::debug;

use super::parser::RawTableRow;

/// Canonical flow fields understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Ipv4SrcAddr,
    Ipv4DstAddr,
    L4SrcPort,
    L4DstPort,
    Protocol,
    TcpFlags,
    InBytes,
    InPkts,
    TimeFirst,
    TimeLast,
    L7Proto,
}

impl Field {
    pub fn canonical_name(self) -> &'static str {
        match self {
            Field::Ipv4SrcAddr => "ipv4_src_addr",
            Field::Ipv4DstAddr => "ipv4_dst_addr",
            Field::L4SrcPort => "l4_src_port",
            Field::L4DstPort => "l4_dst_port",
            Field::Protocol => "protocol",
            Field::TcpFlags => "tcp_flags",
            Field::InBytes => "in_bytes",
            Field::InPkts => "in_pkts",
            Field::TimeFirst => "time_first",
            Field::TimeLast => "time_last",
            Field::L7Proto => "l7_proto",
        }
    }
}

/// Vendor column label → canonical field. Labels are matched exactly;
/// the device mixes upper- and lower-case labels.
pub const VENDOR_COLUMNS: [(&str, Field); 11] = [
    ("IPV4 SRC ADDR", Field::Ipv4SrcAddr),
    ("IPV4 DST ADDR", Field::Ipv4DstAddr),
    ("TRNS SRC PORT", Field::L4SrcPort),
    ("TRNS DST PORT", Field::L4DstPort),
    ("IP PROT", Field::Protocol),
    ("tcp flags", Field::TcpFlags),
    ("bytes long", Field::InBytes),
    ("pkts long", Field::InPkts),
    ("time first", Field::TimeFirst),
    ("time last", Field::TimeLast),
    ("APP NAME", Field::L7Proto),
];

pub fn canonical_field(vendor_column: &str) -> Option<Field> {
    VENDOR_COLUMNS
        .iter()
        .find(|(label, _)| *label == vendor_column)
        .map(|(_, field)| *field)
}

/// A cache row after renaming and coercion, before timestamps are resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedRow<'a> {
    pub ipv4_src_addr: String,
    pub ipv4_dst_addr: String,
    pub l4_src_port: Option<u16>,
    pub l4_dst_port: Option<u16>,
    pub protocol: Option<u8>,
    pub tcp_flags: Option<u32>,
    pub in_bytes: Option<u64>,
    pub in_pkts: Option<u64>,
    pub l7_proto: Option<String>,
    pub time_first: Option<&'a str>,
    pub time_last: Option<&'a str>,
}

/// Counters reported by [`normalize_rows`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub accepted: usize,
    /// Rows dropped because the source or destination address was empty.
    pub missing_identity: usize,
}

/// Normalize one row. Returns `None` when an address is missing.
pub fn normalize_row<'a>(row: &RawTableRow<'a>) -> Option<NormalizedRow<'a>> {
    let mut out = NormalizedRow::default();
    for (column, cell) in row.iter() {
        let Some(field) = canonical_field(column) else {
            continue;
        };
        let cell = cell.trim();
        match field {
            Field::Ipv4SrcAddr => out.ipv4_src_addr = cell.to_string(),
            Field::Ipv4DstAddr => out.ipv4_dst_addr = cell.to_string(),
            Field::L4SrcPort => out.l4_src_port = parse_unsigned(cell),
            Field::L4DstPort => out.l4_dst_port = parse_unsigned(cell),
            Field::Protocol => out.protocol = parse_unsigned(cell),
            Field::TcpFlags => out.tcp_flags = parse_hex_flags(cell),
            Field::InBytes => out.in_bytes = parse_unsigned(cell),
            Field::InPkts => out.in_pkts = parse_unsigned(cell),
            Field::TimeFirst => out.time_first = non_empty(cell),
            Field::TimeLast => out.time_last = non_empty(cell),
            Field::L7Proto => out.l7_proto = non_empty(cell).map(str::to_string),
        }
    }

    if out.ipv4_src_addr.is_empty() || out.ipv4_dst_addr.is_empty() {
        return None;
    }
    Some(out)
}

/// Normalize every row, dropping (and counting) rows without addresses.
pub fn normalize_rows<'a, I>(rows: I) -> (Vec<NormalizedRow<'a>>, NormalizeStats)
where
    I: IntoIterator<Item = RawTableRow<'a>>,
{
    let mut stats = NormalizeStats::default();
    let mut out = Vec::new();
    for row in rows {
        match normalize_row(&row) {
            Some(normalized) => {
                stats.accepted += 1;
                out.push(normalized);
            }
            None => {
                debug!("Dropping cache row without source/destination address");
                stats.missing_identity += 1;
            }
        }
    }
    (out, stats)
}

/// Parse an unsigned integer cell; anything unparsable is missing.
pub fn parse_unsigned<T: FromStr>(cell: &str) -> Option<T> {
    cell.trim().parse().ok()
}

/// Parse a `0x`-prefixed hexadecimal TCP flags cell.
pub fn parse_hex_flags(cell: &str) -> Option<u32> {
    let digits = cell.trim().strip_prefix("0x")?;
    u32::from_str_radix(digits, 16).ok()
}

fn non_empty(cell: &str) -> Option<&str> {
    if cell.is_empty() {
        None
    } else {
        Some(cell)
    }
}
