//! Timestamp resolution and the device wire time format.
//!
//! ELD records carry several candidate time fields of varying quality. The
//! resolver walks them in a fixed precedence order and returns the first one
//! that parses, falling back to the wall clock so callers always get an
//! instant.
//!
//! Devices exchange times as fixed-width `YYMMDDhhmmss` strings in UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Length of a device wire timestamp.
pub const WIRE_LEN: usize = 12;

const WIRE_FORMAT: &str = "%y%m%d%H%M%S";

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Which candidate field produced a resolved timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSource {
    /// The device's own event time.
    EventTime,
    /// GPS fix time.
    GpsTime,
    /// Generic `time` field.
    Time,
    /// Generic `timestamp` field.
    Timestamp,
    /// Nothing parsed; the wall clock was used.
    WallClock,
}

/// How much a resolved timestamp can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Made up from the wall clock.
    Fallback,
    /// Taken from a generic time field.
    Low,
    /// Taken from GPS time.
    Medium,
    /// Taken from the device event time.
    High,
}

impl TimeSource {
    /// Confidence attached to timestamps from this source.
    #[must_use]
    pub const fn confidence(self) -> Confidence {
        match self {
            Self::EventTime => Confidence::High,
            Self::GpsTime => Confidence::Medium,
            Self::Time | Self::Timestamp => Confidence::Low,
            Self::WallClock => Confidence::Fallback,
        }
    }
}

/// Borrowed view over a record's candidate time fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeCandidates<'a> {
    /// Device event time.
    pub event_time: Option<&'a str>,
    /// GPS time.
    pub gps_time: Option<&'a str>,
    /// Generic time.
    pub time: Option<&'a str>,
    /// Generic timestamp.
    pub timestamp: Option<&'a str>,
}

impl<'a> TimeCandidates<'a> {
    /// Candidates in precedence order, skipping absent and blank fields.
    pub fn ordered(&self) -> impl Iterator<Item = (TimeSource, &'a str)> {
        [
            (TimeSource::EventTime, self.event_time),
            (TimeSource::GpsTime, self.gps_time),
            (TimeSource::Time, self.time),
            (TimeSource::Timestamp, self.timestamp),
        ]
        .into_iter()
        .filter_map(|(source, value)| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (source, v))
        })
    }

    /// The first non-empty raw value, parsed or not.
    #[must_use]
    pub fn best_raw(&self) -> Option<&'a str> {
        self.ordered().next().map(|(_, raw)| raw)
    }
}

/// A timestamp chosen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTimestamp {
    /// The instant.
    pub instant: DateTime<Utc>,
    /// Which field it came from.
    pub source: TimeSource,
}

impl ResolvedTimestamp {
    /// Confidence of this resolution.
    #[must_use]
    pub const fn confidence(&self) -> Confidence {
        self.source.confidence()
    }

    /// Whether the wall-clock fallback was used.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.source == TimeSource::WallClock
    }
}

/// Resolve the best instant for a set of candidates, using the current time
/// when nothing parses.
#[must_use]
pub fn resolve(candidates: &TimeCandidates<'_>) -> DateTime<Utc> {
    resolve_with_confidence(candidates, Utc::now()).instant
}

/// Resolve the best instant and the field it came from, using `fallback`
/// when nothing parses.
#[must_use]
pub fn resolve_with_confidence(
    candidates: &TimeCandidates<'_>,
    fallback: DateTime<Utc>,
) -> ResolvedTimestamp {
    candidates
        .ordered()
        .find_map(|(source, raw)| parse_timestamp(raw).map(|instant| ResolvedTimestamp { instant, source }))
        .unwrap_or(ResolvedTimestamp {
            instant: fallback,
            source: TimeSource::WallClock,
        })
}

/// Parse any timestamp representation a device or driver is known to emit.
///
/// Accepts the 12-digit wire format, 10-digit epoch seconds, 13-digit epoch
/// milliseconds, RFC 3339, and naive ISO-8601 date-times (taken as UTC).
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return match raw.len() {
            WIRE_LEN => parse_wire(raw),
            10 => raw
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            13 => raw
                .parse::<i64>()
                .ok()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            _ => None,
        };
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// Parse a `YYMMDDhhmmss` wire timestamp.
#[must_use]
pub fn parse_wire(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() != WIRE_LEN || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, WIRE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format an instant as a `YYMMDDhhmmss` wire timestamp, truncating
/// sub-second precision.
#[must_use]
pub fn format_wire(instant: DateTime<Utc>) -> String {
    instant.format(WIRE_FORMAT).to_string()
}
