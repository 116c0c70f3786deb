//! Per-flow duration and throughput.

use chrono::{DateTime, FixedOffset};

/// Metrics derived from a flow's reconciled timestamps and byte count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowMetrics {
    pub duration_ms: i64,
    /// `None` when the duration is zero or the byte count is missing; a
    /// zero-length flow has no defined rate.
    pub bytes_per_second: Option<f64>,
    pub bits_per_second: Option<f64>,
}

pub fn derive_metrics(
    first_seen: DateTime<FixedOffset>,
    last_seen: DateTime<FixedOffset>,
    in_bytes: Option<u64>,
) -> FlowMetrics {
    let duration_ms = (last_seen - first_seen).num_milliseconds().max(0);

    let bytes_per_second = match in_bytes {
        Some(bytes) if duration_ms > 0 => {
            let rate = bytes as f64 / (duration_ms as f64 / 1000.0);
            rate.is_finite().then_some(rate)
        }
        _ => None,
    };

    FlowMetrics {
        duration_ms,
        bytes_per_second,
        bits_per_second: bytes_per_second.map(|rate| rate * 8.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64, millis: i64) -> DateTime<FixedOffset> {
        let tz = FixedOffset::east_opt(0).unwrap();
        tz.with_ymd_and_hms(2025, 4, 27, 10, 0, 0).unwrap()
            + Duration::seconds(secs)
            + Duration::milliseconds(millis)
    }

    #[test]
    fn rates_over_positive_duration() {
        let m = derive_metrics(at(0, 0), at(4, 0), Some(1500));
        assert_eq!(m.duration_ms, 4000);
        assert_eq!(m.bytes_per_second, Some(375.0));
        assert_eq!(m.bits_per_second, Some(3000.0));
    }

    #[test]
    fn sub_second_duration() {
        let m = derive_metrics(at(0, 0), at(0, 250), Some(1000));
        assert_eq!(m.duration_ms, 250);
        assert_eq!(m.bytes_per_second, Some(4000.0));
        assert_eq!(m.bits_per_second, Some(32000.0));
    }

    #[test]
    fn zero_duration_has_no_rate() {
        let m = derive_metrics(at(5, 0), at(5, 0), Some(1500));
        assert_eq!(m.duration_ms, 0);
        assert_eq!(m.bytes_per_second, None);
        assert_eq!(m.bits_per_second, None);
    }

    #[test]
    fn missing_bytes_has_no_rate() {
        let m = derive_metrics(at(0, 0), at(2, 0), None);
        assert_eq!(m.duration_ms, 2000);
        assert_eq!(m.bytes_per_second, None);
        assert_eq!(m.bits_per_second, None);
    }

    #[test]
    fn inverted_timestamps_clamp_to_zero() {
        let m = derive_metrics(at(3, 0), at(1, 0), Some(10));
        assert_eq!(m.duration_ms, 0);
        assert!(m.bytes_per_second.is_none());
    }
}
