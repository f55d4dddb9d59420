//! Logical/Real Time Representation
//!
//! Nanosecond timestamps with a signed 64-bit range (~292 years around the
//! Unix epoch). Logical time is the semantic sample timestamp used as the
//! alignment ordering key; realtime is the wall-clock instant a sample was
//! recorded. Both share this representation.

use std::fmt;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

/// Conversion constants
pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Convert a chrono DateTime to Nanos.
#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Convert Nanos to a chrono DateTime.
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    chrono::Utc.timestamp_opt(secs, nsecs).unwrap()
}

/// Parse an ISO8601/RFC3339 string to Nanos.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| datetime_to_nanos(&dt.with_timezone(&chrono::Utc)))
}

/// A closed `[start, end]` logical- or real-time interval.
///
/// Empty streams have no interval; use `Option<TimeInterval>` for those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: Nanos,
    pub end: Nanos,
}

impl TimeInterval {
    #[inline]
    pub fn new(start: Nanos, end: Nanos) -> Self {
        Self { start, end }
    }

    /// Union of two intervals (smallest interval covering both).
    #[inline]
    pub fn union(&self, other: &TimeInterval) -> TimeInterval {
        TimeInterval {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Intersect with optional bounds, returning None when the result is empty.
    pub fn clamp(&self, from: Option<Nanos>, to: Option<Nanos>) -> Option<TimeInterval> {
        let start = from.map_or(self.start, |f| self.start.max(f));
        let end = to.map_or(self.end, |t| self.end.min(t));
        if start > end {
            None
        } else {
            Some(TimeInterval { start, end })
        }
    }

    #[inline]
    pub fn contains(&self, t: Nanos) -> bool {
        self.start <= t && t <= self.end
    }

    /// Duration in nanoseconds.
    #[inline]
    pub fn duration(&self) -> Nanos {
        self.end - self.start
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}]",
            nanos_to_datetime(self.start).to_rfc3339(),
            nanos_to_datetime(self.end).to_rfc3339()
        )
    }
}
