//! Device link capability.
//!
//! The sync core never talks to a radio directly. Everything it needs from the
//! platform BLE driver is expressed by the [`DeviceLink`] trait: scan,
//! connect, disconnect, send a history query, report connectivity, and a
//! broadcast stream of [`LinkEvent`]s.
//!
//! Implementations:
//!
//! - [`sim::SimulatedLink`] - in-process ELD simulator, no hardware required
//! - `mock::MockLink` - scriptable fake for tests (`mock-link` feature)
//! - `bluez::BluezLink` - BlueZ GATT driver (`bluetooth` feature, Linux)

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::packet::{FrameError, VehicleSample};
use crate::record::TelemetryRecord;

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-link"))]
pub mod mock;
pub mod sim;

/// Capacity of link event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors reported by a device link driver.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// Bluetooth is switched off.
    #[error("Bluetooth is disabled")]
    BluetoothDisabled,

    /// BLE is not available on this host.
    #[error("BLE is not supported")]
    BleUnsupported,

    /// The address is unknown to the driver.
    #[error("device {address} not found")]
    DeviceNotFound {
        /// Requested address.
        address: String,
    },

    /// A command needs a connection and there is none.
    #[error("no device connected")]
    NotConnected,

    /// The device refused a command.
    #[error("command rejected: {message}")]
    CommandRejected {
        /// Device-provided reason.
        message: String,
    },

    /// The radio transport failed.
    #[error("transport failure: {message}")]
    Transport {
        /// Driver-provided detail.
        message: String,
    },

    /// Driver bug or unexpected state.
    #[error("internal driver error: {message}")]
    Internal {
        /// Driver-provided detail.
        message: String,
    },
}

/// Result alias for link operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Bluetooth MAC address.
    #[schema(example = "C4:A8:28:43:14:9A")]
    pub address: String,

    /// Advertised name.
    #[schema(example = "KD032-43149A")]
    pub name: Option<String>,

    /// Signal strength in dBm.
    #[schema(example = -61)]
    pub rssi: Option<i16>,
}

/// Outcome of a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Link is up; authentication follows.
    Connected,
    /// The driver gave up with a status code.
    Failure {
        /// Driver status code.
        status: i32,
    },
}

/// Connectivity snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    /// A device is connected right now.
    pub is_connected: bool,
    /// The host radio is on.
    pub is_bluetooth_enabled: bool,
    /// The host supports BLE.
    pub is_ble_supported: bool,
    /// Address of the connected device.
    pub current_device: Option<String>,
}

/// Which history log to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Duty-status and ELD event log.
    EldEvents,
    /// Raw engine/vehicle samples.
    EngineData,
}

impl HistoryKind {
    /// Code used in query commands.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::EldEvents => 0,
            Self::EngineData => 1,
        }
    }

    /// Inverse of [`code`](Self::code).
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::EldEvents),
            1 => Some(Self::EngineData),
            _ => None,
        }
    }

    /// Name for logs and progress labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EldEvents => "eld_events",
            Self::EngineData => "engine_data",
        }
    }
}

/// Whether telemetry was pushed live or returned by a history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryOrigin {
    /// Pushed by the device as it happened.
    Live,
    /// Returned in response to a history query.
    History,
}

/// Undecoded telemetry as delivered by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// A JSON object produced by the driver.
    Json(serde_json::Value),
    /// A binary vehicle frame.
    Frame(Vec<u8>),
}

/// Telemetry delivery failure.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// JSON did not describe a record.
    #[error("invalid telemetry JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Frame did not decode.
    #[error("invalid telemetry frame: {0}")]
    Frame(#[from] FrameError),
}

/// Telemetry as it arrives on the event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Live or history.
    pub origin: TelemetryOrigin,
    /// Undecoded payload.
    pub payload: RawPayload,
}

impl Telemetry {
    /// Decode into a record, stamping `received_at` if the payload has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decode.
    pub fn decode(
        &self,
        device_id: Option<String>,
        received_at: DateTime<Utc>,
    ) -> Result<TelemetryRecord, DecodeError> {
        match &self.payload {
            RawPayload::Json(value) => {
                let mut record: TelemetryRecord = serde_json::from_value(value.clone())?;
                record.received_at.get_or_insert(received_at);
                record.fill_device_id(device_id.as_deref());
                Ok(record)
            }
            RawPayload::Frame(bytes) => {
                Ok(VehicleSample::decode(bytes)?.into_record(device_id, received_at))
            }
        }
    }
}

/// Inbound notification from the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A scan found (or re-found) a device.
    DeviceFound(DiscoveredDevice),
    /// The link came up.
    Connected,
    /// A connect attempt failed.
    ConnectFailure {
        /// Driver status code.
        status: i32,
    },
    /// The device accepted our credentials.
    AuthenticationPassed {
        /// Device id reported by the device.
        device_id: Option<String>,
    },
    /// The device rejected our credentials.
    AuthenticationFailed {
        /// Device-provided reason.
        reason: String,
    },
    /// The link went down.
    Disconnected,
    /// A telemetry payload arrived.
    Telemetry(Telemetry),
    /// The driver reported an error outside any command.
    Error {
        /// Driver-provided detail.
        message: String,
    },
}

impl LinkEvent {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DeviceFound(_) => "device_found",
            Self::Connected => "connected",
            Self::ConnectFailure { .. } => "connect_failure",
            Self::AuthenticationPassed { .. } => "authentication_passed",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::Disconnected => "disconnected",
            Self::Telemetry(_) => "telemetry",
            Self::Error { .. } => "error",
        }
    }
}

/// Turn one raw characteristic notification into a link event.
///
/// Notifications starting with the frame start flag are binary vehicle
/// frames. Everything else is expected to be a UTF-8 JSON object whose
/// `type` field tells authentication replies (`"auth"`, with `status` and
/// `deviceId` or `reason`) and history replies (`"history"`) apart from live
/// telemetry.
#[must_use]
pub fn event_from_notification(value: &[u8]) -> LinkEvent {
    if value.first() == Some(&crate::packet::START_FLAG) {
        return LinkEvent::Telemetry(Telemetry {
            origin: TelemetryOrigin::Live,
            payload: RawPayload::Frame(value.to_vec()),
        });
    }

    let json: serde_json::Value = match serde_json::from_slice(value) {
        Ok(json @ serde_json::Value::Object(_)) => json,
        Ok(_) => {
            return LinkEvent::Error {
                message: "notification is not a JSON object".to_string(),
            }
        }
        Err(err) => {
            return LinkEvent::Error {
                message: format!("undecodable notification: {err}"),
            }
        }
    };

    let field = |name: &str| json.get(name).and_then(serde_json::Value::as_str);
    match field("type") {
        Some("auth") if field("status") == Some("ok") => LinkEvent::AuthenticationPassed {
            device_id: field("deviceId").map(str::to_string),
        },
        Some("auth") => LinkEvent::AuthenticationFailed {
            reason: field("reason").unwrap_or("rejected").to_string(),
        },
        Some("history") => LinkEvent::Telemetry(Telemetry {
            origin: TelemetryOrigin::History,
            payload: RawPayload::Json(json),
        }),
        _ => LinkEvent::Telemetry(Telemetry {
            origin: TelemetryOrigin::Live,
            payload: RawPayload::Json(json),
        }),
    }
}

/// Capability interface over the platform BLE driver.
///
/// Calls may suspend; none of them may block the executor. Results of
/// [`query_history`](Self::query_history) arrive later as
/// [`LinkEvent::Telemetry`] with [`TelemetryOrigin::History`].
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Begin scanning; devices are reported as [`LinkEvent::DeviceFound`].
    async fn start_scan(&self) -> LinkResult<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> LinkResult<()>;

    /// Connect to the device at `address`.
    async fn connect(&self, address: &str) -> LinkResult<ConnectOutcome>;

    /// Drop the current connection.
    async fn disconnect(&self) -> LinkResult<()>;

    /// Ask the device to replay history between two wire timestamps.
    async fn query_history(
        &self,
        kind: HistoryKind,
        formatted_start: &str,
        formatted_end: &str,
    ) -> LinkResult<()>;

    /// Current connectivity.
    async fn connection_status(&self) -> LinkResult<LinkStatus>;

    /// Subscribe to inbound events.
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;
}

/// Shared handle to a device link.
pub type SharedLink = Arc<dyn DeviceLink>;

/// Whether a scanned device passes the configured name-prefix filter.
#[must_use]
pub fn matches_name_filter(device: &DiscoveredDevice, prefixes: &[String]) -> bool {
    if prefixes.is_empty() {
        return true;
    }
    device
        .name
        .as_deref()
        .is_some_and(|name| prefixes.iter().any(|p| name.starts_with(p.as_str())))
}
