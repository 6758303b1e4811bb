//! In-process ELD simulator.
//!
//! Behaves like a bench ELD: it advertises one device, authenticates shortly
//! after connecting, streams a vehicle sample frame every few seconds, and
//! answers history queries from a synthetic duty-status log that reaches back
//! a fixed depth from "now".

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    ConnectOutcome, DeviceLink, DiscoveredDevice, HistoryKind, LinkError, LinkEvent, LinkResult,
    LinkStatus, RawPayload, Telemetry, TelemetryOrigin, EVENT_CHANNEL_CAPACITY,
};
use crate::packet::{Command, Opcode, VehicleSample, VEHICLE_SAMPLE};
use crate::record::DutyStatus;
use crate::timestamp;

/// Duty-status change event type in the synthetic log.
pub const DUTY_STATUS_EVENT: i64 = 1;
/// Engine sample event type in the synthetic log.
pub const ENGINE_SAMPLE_EVENT: i64 = 2;

/// Simulator timing and data shape.
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// Advertised device.
    pub device: DiscoveredDevice,
    /// Device id reported on authentication.
    pub device_id: String,
    /// Delay between link-up and authentication.
    pub auth_delay: Duration,
    /// Delay before a history query starts replaying.
    pub reply_delay: Duration,
    /// Live frame period.
    pub sample_interval: Duration,
    /// Spacing of synthetic history events.
    pub event_interval: TimeDelta,
    /// How far back the synthetic log reaches.
    pub history_depth: TimeDelta,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            device: DiscoveredDevice {
                address: "C4:A8:28:43:14:9A".to_string(),
                name: Some("KD032-43149A".to_string()),
                rssi: Some(-55),
            },
            device_id: "PT30-ELD-001".to_string(),
            auth_delay: Duration::from_millis(200),
            reply_delay: Duration::from_millis(50),
            sample_interval: Duration::from_secs(3),
            event_interval: TimeDelta::minutes(2),
            history_depth: TimeDelta::hours(12),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    current: Option<String>,
    session: Option<CancellationToken>,
}

/// Simulated ELD implementing [`DeviceLink`].
#[derive(Debug)]
pub struct SimulatedLink {
    events: broadcast::Sender<LinkEvent>,
    settings: SimulatorSettings,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new(SimulatorSettings::default())
    }
}

impl SimulatedLink {
    /// Create a simulator.
    #[must_use]
    pub fn new(settings: SimulatorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            settings,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synthetic history events of `kind` in `[start, end)`, clipped to the
    /// simulated log depth and to the present.
    #[must_use]
    pub fn history_between(
        &self,
        kind: HistoryKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<serde_json::Value> {
        let step = self.settings.event_interval;
        let floor = now - self.settings.history_depth;
        let from = start.max(floor);
        let until = end.min(now);
        if from >= until || step <= TimeDelta::zero() {
            return Vec::new();
        }

        let Ok(mut at) = from.duration_trunc(step) else {
            return Vec::new();
        };
        if at < from {
            at += step;
        }

        let step_secs = step.num_seconds().max(1);
        let mut out = Vec::new();
        while at < until {
            let seq = at.timestamp() / step_secs;
            out.push(self.synthetic_event(kind, seq, at));
            at += step;
        }
        out
    }

    fn synthetic_event(&self, kind: HistoryKind, seq: i64, at: DateTime<Utc>) -> serde_json::Value {
        match kind {
            HistoryKind::EldEvents => {
                let status = DutyStatus::from_code(u8::try_from(seq.rem_euclid(4) + 1).unwrap_or(1))
                    .unwrap_or(DutyStatus::OffDuty);
                json!({
                    "deviceId": self.settings.device_id,
                    "eventTime": timestamp::format_wire(at),
                    "eventType": DUTY_STATUS_EVENT,
                    "eventId": seq,
                    "dutyStatus": status.code(),
                })
            }
            HistoryKind::EngineData => json!({
                "deviceId": self.settings.device_id,
                "eventTime": timestamp::format_wire(at),
                "eventType": ENGINE_SAMPLE_EVENT,
                "eventId": seq,
                "rpm": 1500 + seq.rem_euclid(500),
                "odometerMiles": 125_000 + seq.rem_euclid(10_000),
            }),
        }
    }

    fn live_sample(counter: u32) -> VehicleSample {
        let fuel = 75.0 - f64::from(counter) * 0.1;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let fuel_level = fuel.max(10.0) as u8;
        #[allow(clippy::cast_possible_truncation)]
        let duty_status = (counter % 4) as u8 + 1;
        VehicleSample {
            frame_type: VEHICLE_SAMPLE,
            speed_mph: f64::from(45 + counter % 20),
            rpm: u16::try_from(1500 + counter % 500).unwrap_or(u16::MAX),
            fuel_level,
            odometer_miles: 125_000 + counter,
            duty_status,
        }
    }

    /// Parse a command frame the way the device firmware would, returning
    /// the requested history kind and window.
    fn parse_history_query(
        frame: &[u8],
    ) -> LinkResult<(HistoryKind, DateTime<Utc>, DateTime<Utc>)> {
        let rejected = |message: String| LinkError::CommandRejected { message };
        let command = Command::decode(frame).map_err(|err| rejected(err.to_string()))?;
        if command.opcode != Opcode::QueryHistory {
            return Err(rejected(format!("unexpected opcode {:?}", command.opcode)));
        }

        let mut fields = command.payload.split(',');
        let (Some(code), Some(start), Some(end), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(rejected(format!("malformed query {:?}", command.payload)));
        };
        let kind = code
            .parse()
            .ok()
            .and_then(HistoryKind::from_code)
            .ok_or_else(|| rejected(format!("unknown history kind {code}")))?;
        match (timestamp::parse_wire(start), timestamp::parse_wire(end)) {
            (Some(start), Some(end)) => Ok((kind, start, end)),
            _ => Err(rejected(format!("bad range {start}..{end}"))),
        }
    }

    fn spawn_session(&self, token: CancellationToken) {
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let device_id = self.settings.device_id.clone();
        let auth_delay = self.settings.auth_delay;
        let interval = self.settings.sample_interval;

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(auth_delay) => {}
            }
            let still_connected = state
                .lock()
                .map(|s| s.connected)
                .unwrap_or(false);
            if !still_connected {
                return;
            }
            let _ = events.send(LinkEvent::AuthenticationPassed {
                device_id: Some(device_id),
            });

            let mut counter = 0u32;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = Self::live_sample(counter).encode();
                        let _ = events.send(LinkEvent::Telemetry(Telemetry {
                            origin: TelemetryOrigin::Live,
                            payload: RawPayload::Frame(frame),
                        }));
                        counter = counter.wrapping_add(1);
                    }
                }
            }
            debug!("simulated live stream stopped");
        });
    }
}

#[async_trait]
impl DeviceLink for SimulatedLink {
    async fn start_scan(&self) -> LinkResult<()> {
        let _ = self
            .events
            .send(LinkEvent::DeviceFound(self.settings.device.clone()));
        Ok(())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        Ok(())
    }

    async fn connect(&self, address: &str) -> LinkResult<ConnectOutcome> {
        if address != self.settings.device.address {
            return Err(LinkError::DeviceNotFound {
                address: address.to_string(),
            });
        }

        let token = CancellationToken::new();
        {
            let mut state = self.state();
            if let Some(previous) = state.session.replace(token.clone()) {
                previous.cancel();
            }
            state.connected = true;
            state.current = Some(address.to_string());
        }
        info!(address, "simulated ELD connected");
        let _ = self.events.send(LinkEvent::Connected);
        self.spawn_session(token);
        Ok(ConnectOutcome::Connected)
    }

    async fn disconnect(&self) -> LinkResult<()> {
        let was_connected = {
            let mut state = self.state();
            if let Some(session) = state.session.take() {
                session.cancel();
            }
            state.current = None;
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            let _ = self.events.send(LinkEvent::Disconnected);
        }
        Ok(())
    }

    async fn query_history(
        &self,
        kind: HistoryKind,
        formatted_start: &str,
        formatted_end: &str,
    ) -> LinkResult<()> {
        if !self.state().connected {
            return Err(LinkError::NotConnected);
        }
        let frame = Command::query_history(kind.code(), formatted_start, formatted_end).encode();
        let (kind, start, end) = Self::parse_history_query(&frame)?;

        let replay = self.history_between(kind, start, end, Utc::now());
        debug!(?kind, formatted_start, formatted_end, count = replay.len(), "replaying history");

        let events = self.events.clone();
        let delay = self.settings.reply_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for value in replay {
                let _ = events.send(LinkEvent::Telemetry(Telemetry {
                    origin: TelemetryOrigin::History,
                    payload: RawPayload::Json(value),
                }));
            }
        });
        Ok(())
    }

    async fn connection_status(&self) -> LinkResult<LinkStatus> {
        let state = self.state();
        Ok(LinkStatus {
            is_connected: state.connected,
            is_bluetooth_enabled: true,
            is_ble_supported: true,
            current_device: state.current.clone(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
