//! Turn the cache's date-less `time first` / `time last` columns into
//! absolute timestamps.
//!
//! The device only prints a time of day. The reference date is attached to
//! both values; when the result has last-seen before first-seen the flow is
//! taken to have crossed midnight and last-seen moves forward one day. The
//! naive timestamps are read in the device's timezone and converted to the
//! canonical timezone.

use chrono::{
    DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::Tz;

use super::types::Timing;

const TIME_FORMATS: [&str; 2] = ["%H:%M:%S%.f", "%H:%M"];

/// A timezone: either a fixed UTC offset or an IANA zone with DST rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Zone {
    pub fn utc() -> Self {
        Zone::Fixed(Utc.fix())
    }

    /// Calendar date of `instant` in this zone.
    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            Zone::Fixed(offset) => instant.with_timezone(offset).date_naive(),
            Zone::Named(tz) => instant.with_timezone(tz).date_naive(),
        }
    }

    /// `instant` expressed in this zone, with the offset in effect at that
    /// instant.
    pub fn convert(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            Zone::Fixed(offset) => instant.with_timezone(offset),
            Zone::Named(tz) => instant.with_timezone(tz).fixed_offset(),
        }
    }

    /// Read a wall-clock time in this zone.
    ///
    /// A time repeated by a DST fall-back resolves to its first occurrence.
    /// A time skipped by a spring-forward gap is read one hour later, which
    /// is the wall clock after the jump.
    pub fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        let resolve = |naive: &NaiveDateTime| match self {
            Zone::Fixed(offset) => earliest_utc(offset.from_local_datetime(naive)),
            Zone::Named(tz) => earliest_utc(tz.from_local_datetime(naive)),
        };
        resolve(&naive).or_else(|| resolve(&(naive + Duration::hours(1))))
    }
}

fn earliest_utc<Z: TimeZone>(local: LocalResult<DateTime<Z>>) -> Option<DateTime<Utc>> {
    match local {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Resolved timezones used by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timezones {
    /// Zone whose calendar date is attached to cache times.
    pub reference: Zone,
    /// Zone of the device clock.
    pub device: Zone,
    /// Zone of persisted timestamps.
    pub canonical: Zone,
}

impl Timezones {
    pub fn utc() -> Self {
        Self {
            reference: Zone::utc(),
            device: Zone::utc(),
            canonical: Zone::utc(),
        }
    }
}

/// A clock snapshot taken once per batch so every record in the batch is
/// reconciled against the same date and fallback time.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileClock {
    pub today: NaiveDate,
    pub now: DateTime<Utc>,
}

impl ReconcileClock {
    pub fn at(now: DateTime<Utc>, tz: &Timezones) -> Self {
        Self {
            today: tz.reference.date_of(now),
            now,
        }
    }

    pub fn now(tz: &Timezones) -> Self {
        Self::at(Utc::now(), tz)
    }
}

/// First/last-seen timestamps in the canonical timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub first_seen: DateTime<FixedOffset>,
    pub last_seen: DateTime<FixedOffset>,
    pub timing: Timing,
}

/// Reconcile one record's time-of-day strings.
///
/// Total: a missing or unparsable string yields [`Timing::Fallback`] with both
/// timestamps set to the clock's `now` in the canonical timezone.
pub fn reconcile(
    time_first: Option<&str>,
    time_last: Option<&str>,
    clock: &ReconcileClock,
    tz: &Timezones,
) -> Reconciled {
    let parsed = time_first
        .and_then(parse_time_of_day)
        .zip(time_last.and_then(parse_time_of_day));

    let Some((first_tod, last_tod)) = parsed else {
        return fallback(clock, tz);
    };

    let first = NaiveDateTime::new(clock.today, first_tod);
    let mut last = NaiveDateTime::new(clock.today, last_tod);
    let mut timing = Timing::Reconciled;
    if last < first {
        last += Duration::days(1);
        timing = Timing::Rollover;
    }

    match (localize(first, tz), localize(last, tz)) {
        (Some(first_seen), Some(last_seen)) => Reconciled {
            first_seen,
            last_seen,
            timing,
        },
        _ => fallback(clock, tz),
    }
}

/// Parse `HH:MM:SS`, `HH:MM:SS.fff` or `HH:MM`.
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(value, fmt).ok())
}

fn localize(naive: NaiveDateTime, tz: &Timezones) -> Option<DateTime<FixedOffset>> {
    tz.device
        .localize(naive)
        .map(|instant| tz.canonical.convert(instant))
}

fn fallback(clock: &ReconcileClock, tz: &Timezones) -> Reconciled {
    let now = tz.canonical.convert(clock.now);
    Reconciled {
        first_seen: now,
        last_seen: now,
        timing: Timing::Fallback,
    }
}
