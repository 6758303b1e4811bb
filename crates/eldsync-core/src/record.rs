//! Telemetry records and their identity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::timestamp::{self, ResolvedTimestamp, TimeCandidates};

/// Device id used in composite keys when a record does not carry one.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Sentinel for an absent event type or id in composite keys.
pub const ABSENT_DISCRIMINATOR: i64 = -1;

/// One device-reported event or sensor sample.
///
/// Field names follow the driver's camelCase JSON. Anything the sync core does
/// not interpret is kept in [`payload`](Self::payload) and written back out
/// flattened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    /// Device that produced the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(example = "PT30-ELD-001")]
    pub device_id: Option<String>,

    /// Device event time (highest precedence).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(example = "250115033000")]
    pub event_time: Option<String>,

    /// GPS fix time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gps_time: Option<String>,

    /// Generic time field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    /// Generic timestamp field (lowest precedence).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// When this host received the record. Tie-breaker only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,

    /// Domain discriminator (duty-status change, diagnostic, raw frame...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<i64>,

    /// Device-assigned event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<i64>,

    /// Opaque payload fields.
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub payload: Map<String, Value>,
}

/// Identity of a logical event: `(deviceId, raw time, eventType, eventId)`.
///
/// The time component is the raw string of the best candidate field, not the
/// resolved instant, so `"250115033000"` and `"2025-01-15T03:30:00Z"` are
/// different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Device id or [`UNKNOWN_DEVICE`].
    pub device_id: String,
    /// Raw best time field, empty when the record has none.
    pub raw_time: String,
    /// Event type or [`ABSENT_DISCRIMINATOR`].
    pub event_type: i64,
    /// Event id or [`ABSENT_DISCRIMINATOR`].
    pub event_id: i64,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.device_id, self.raw_time, self.event_type, self.event_id
        )
    }
}

impl TelemetryRecord {
    /// Borrow the candidate time fields.
    #[must_use]
    pub fn time_candidates(&self) -> TimeCandidates<'_> {
        TimeCandidates {
            event_time: self.event_time.as_deref(),
            gps_time: self.gps_time.as_deref(),
            time: self.time.as_deref(),
            timestamp: self.timestamp.as_deref(),
        }
    }

    /// Composite identity key.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            device_id: self
                .device_id
                .clone()
                .unwrap_or_else(|| UNKNOWN_DEVICE.to_string()),
            raw_time: self
                .time_candidates()
                .best_raw()
                .unwrap_or_default()
                .to_string(),
            event_type: self.event_type.unwrap_or(ABSENT_DISCRIMINATOR),
            event_id: self.event_id.unwrap_or(ABSENT_DISCRIMINATOR),
        }
    }

    /// Attribute the record to `device_id` unless it already names a device.
    pub fn fill_device_id(&mut self, device_id: Option<&str>) {
        if self.device_id.is_none() {
            self.device_id = device_id.map(str::to_string);
        }
    }

    /// Best instant for this record; the current time if nothing parses.
    #[must_use]
    pub fn resolved_time(&self) -> DateTime<Utc> {
        timestamp::resolve(&self.time_candidates())
    }

    /// Best instant with its source, using `fallback` if nothing parses.
    #[must_use]
    pub fn resolve_with_confidence(&self, fallback: DateTime<Utc>) -> ResolvedTimestamp {
        timestamp::resolve_with_confidence(&self.time_candidates(), fallback)
    }

    /// Duty status carried in the payload, if any.
    #[must_use]
    pub fn duty_status(&self) -> Option<DutyStatus> {
        self.payload
            .get("dutyStatus")
            .and_then(Value::as_u64)
            .and_then(|code| u8::try_from(code).ok())
            .and_then(DutyStatus::from_code)
    }
}

/// Driver duty status codes as reported by vehicle frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DutyStatus {
    /// Off duty.
    OffDuty,
    /// Sleeper berth.
    SleeperBerth,
    /// Driving.
    Driving,
    /// On duty, not driving.
    OnDutyNotDriving,
}

impl DutyStatus {
    /// Decode a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::OffDuty),
            2 => Some(Self::SleeperBerth),
            3 => Some(Self::Driving),
            4 => Some(Self::OnDutyNotDriving),
            _ => None,
        }
    }

    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::OffDuty => 1,
            Self::SleeperBerth => 2,
            Self::Driving => 3,
            Self::OnDutyNotDriving => 4,
        }
    }
}
