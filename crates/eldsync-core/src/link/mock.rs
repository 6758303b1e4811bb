//! Scriptable in-memory link for tests.
//!
//! Every call completes immediately and deterministically. Behaviour is set up
//! front (failures to inject, how authentication goes, which history the
//! "device" holds) and every history query is recorded for later assertions.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{
    ConnectOutcome, DeviceLink, DiscoveredDevice, HistoryKind, LinkError, LinkEvent, LinkResult,
    LinkStatus, RawPayload, Telemetry, TelemetryOrigin, EVENT_CHANNEL_CAPACITY,
};
use crate::record::TelemetryRecord;
use crate::timestamp;

/// How the mock device answers authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthBehaviour {
    /// Emit `AuthenticationPassed` right after connecting.
    Pass,
    /// Emit `AuthenticationFailed` with this reason.
    Reject(String),
    /// Never answer.
    Silent,
}

/// One recorded history query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLog {
    /// Requested log.
    pub kind: HistoryKind,
    /// Wire start.
    pub start: String,
    /// Wire end.
    pub end: String,
}

#[derive(Debug)]
struct MockState {
    connected: bool,
    bluetooth_enabled: bool,
    current: Option<String>,
    device_id: String,
    devices: Vec<DiscoveredDevice>,
    connect_outcomes: VecDeque<ConnectOutcome>,
    auth: AuthBehaviour,
    drop_after_auth: bool,
    history: Vec<TelemetryRecord>,
    fixed_reply: Option<Vec<TelemetryRecord>>,
    failing_queries: usize,
    always_fail_queries: bool,
    failing_status_checks: usize,
    drop_after_queries: usize,
    transient_drop: bool,
    queries: Vec<QueryLog>,
    query_attempts: usize,
    scanning: bool,
}

/// Deterministic fake [`DeviceLink`].
#[derive(Debug)]
pub struct MockLink {
    events: broadcast::Sender<LinkEvent>,
    state: Mutex<MockState>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// A mock with one discoverable ELD that connects and authenticates.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            state: Mutex::new(MockState {
                connected: false,
                bluetooth_enabled: true,
                current: None,
                device_id: "PT30-ELD-001".to_string(),
                devices: vec![DiscoveredDevice {
                    address: "C4:A8:28:43:14:9A".to_string(),
                    name: Some("PT30-ELD-001".to_string()),
                    rssi: Some(-58),
                }],
                connect_outcomes: VecDeque::new(),
                auth: AuthBehaviour::Pass,
                drop_after_auth: false,
                history: Vec::new(),
                fixed_reply: None,
                failing_queries: 0,
                always_fail_queries: false,
                failing_status_checks: 0,
                drop_after_queries: 0,
                transient_drop: false,
                queries: Vec::new(),
                query_attempts: 0,
                scanning: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine for a fake device.
        let _ = self.events.send(event);
    }

    /// Records the device will replay when queried.
    pub fn set_history(&self, records: Vec<TelemetryRecord>) {
        self.state().history = records;
    }

    /// Answer every query with `records`, whatever range was asked for.
    pub fn set_fixed_reply(&self, records: Vec<TelemetryRecord>) {
        self.state().fixed_reply = Some(records);
    }

    /// Queue a connect outcome; unqueued attempts succeed.
    pub fn push_connect_outcome(&self, outcome: ConnectOutcome) {
        self.state().connect_outcomes.push_back(outcome);
    }

    /// Change how authentication is answered.
    pub fn set_auth(&self, auth: AuthBehaviour) {
        self.state().auth = auth;
    }

    /// Silently lose the link right after authentication passes.
    pub fn drop_after_authentication(&self) {
        self.state().drop_after_auth = true;
    }

    /// Fail the next `n` history queries with a transport error.
    pub fn fail_next_queries(&self, n: usize) {
        self.state().failing_queries = n;
    }

    /// Fail every history query.
    pub fn fail_all_queries(&self) {
        self.state().always_fail_queries = true;
    }

    /// Fail the next `n` status checks.
    pub fn fail_next_status_checks(&self, n: usize) {
        self.state().failing_status_checks = n;
    }

    /// Report the link as down after each of the next `n` queries; the next
    /// status check after that query restores it.
    pub fn drop_after_next_queries(&self, n: usize) {
        self.state().drop_after_queries = n;
    }

    /// Force the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// Toggle the host radio.
    pub fn set_bluetooth_enabled(&self, enabled: bool) {
        self.state().bluetooth_enabled = enabled;
    }

    /// Push a live record as the device would.
    pub fn push_live(&self, record: &TelemetryRecord) {
        let value = serde_json::to_value(record).unwrap_or_default();
        self.emit(LinkEvent::Telemetry(Telemetry {
            origin: TelemetryOrigin::Live,
            payload: RawPayload::Json(value),
        }));
    }

    /// Inject an arbitrary event.
    pub fn inject(&self, event: LinkEvent) {
        self.emit(event);
    }

    /// Successful queries issued so far.
    #[must_use]
    pub fn queries(&self) -> Vec<QueryLog> {
        self.state().queries.clone()
    }

    /// Every query attempt, failed ones included.
    #[must_use]
    pub fn query_attempts(&self) -> usize {
        self.state().query_attempts
    }

    /// Whether a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn start_scan(&self) -> LinkResult<()> {
        let devices = {
            let mut state = self.state();
            if !state.bluetooth_enabled {
                return Err(LinkError::BluetoothDisabled);
            }
            state.scanning = true;
            state.devices.clone()
        };
        for device in devices {
            self.emit(LinkEvent::DeviceFound(device));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        self.state().scanning = false;
        Ok(())
    }

    async fn connect(&self, address: &str) -> LinkResult<ConnectOutcome> {
        let (outcome, auth, device_id) = {
            let mut state = self.state();
            if !state.bluetooth_enabled {
                return Err(LinkError::BluetoothDisabled);
            }
            if !state.devices.iter().any(|d| d.address == address) {
                return Err(LinkError::DeviceNotFound {
                    address: address.to_string(),
                });
            }
            let outcome = state
                .connect_outcomes
                .pop_front()
                .unwrap_or(ConnectOutcome::Connected);
            if outcome == ConnectOutcome::Connected {
                state.connected = true;
                state.current = Some(address.to_string());
            }
            (outcome, state.auth.clone(), state.device_id.clone())
        };

        match outcome {
            ConnectOutcome::Connected => {
                self.emit(LinkEvent::Connected);
                match auth {
                    AuthBehaviour::Pass => {
                        {
                            let mut state = self.state();
                            if state.drop_after_auth {
                                state.connected = false;
                            }
                        }
                        self.emit(LinkEvent::AuthenticationPassed {
                            device_id: Some(device_id),
                        });
                    }
                    AuthBehaviour::Reject(reason) => {
                        self.emit(LinkEvent::AuthenticationFailed { reason });
                    }
                    AuthBehaviour::Silent => {}
                }
            }
            ConnectOutcome::Failure { status } => {
                self.emit(LinkEvent::ConnectFailure { status });
            }
        }
        Ok(outcome)
    }

    async fn disconnect(&self) -> LinkResult<()> {
        let was_connected = {
            let mut state = self.state();
            let was = state.connected;
            state.connected = false;
            state.current = None;
            was
        };
        if was_connected {
            self.emit(LinkEvent::Disconnected);
        }
        Ok(())
    }

    async fn query_history(
        &self,
        kind: HistoryKind,
        formatted_start: &str,
        formatted_end: &str,
    ) -> LinkResult<()> {
        let matching = {
            let mut state = self.state();
            state.query_attempts += 1;
            if !state.connected {
                return Err(LinkError::NotConnected);
            }
            if state.always_fail_queries {
                return Err(LinkError::Transport {
                    message: "simulated radio failure".to_string(),
                });
            }
            if state.failing_queries > 0 {
                state.failing_queries -= 1;
                return Err(LinkError::Transport {
                    message: "simulated radio failure".to_string(),
                });
            }
            state.queries.push(QueryLog {
                kind,
                start: formatted_start.to_string(),
                end: formatted_end.to_string(),
            });
            if state.drop_after_queries > 0 {
                state.drop_after_queries -= 1;
                state.connected = false;
                state.transient_drop = true;
            }

            if let Some(reply) = &state.fixed_reply {
                reply.clone()
            } else {
                let start = timestamp::parse_wire(formatted_start);
                let end = timestamp::parse_wire(formatted_end);
                let (Some(start), Some(end)) = (start, end) else {
                    return Err(LinkError::CommandRejected {
                        message: "malformed time range".to_string(),
                    });
                };
                state
                    .history
                    .iter()
                    .filter(|record| {
                        let at = record.resolved_time();
                        at >= start && at < end
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            }
        };

        for record in matching {
            let value = serde_json::to_value(&record).unwrap_or_default();
            self.emit(LinkEvent::Telemetry(Telemetry {
                origin: TelemetryOrigin::History,
                payload: RawPayload::Json(value),
            }));
        }
        Ok(())
    }

    async fn connection_status(&self) -> LinkResult<LinkStatus> {
        let mut state = self.state();
        if state.failing_status_checks > 0 {
            state.failing_status_checks -= 1;
            return Err(LinkError::Transport {
                message: "status read failed".to_string(),
            });
        }
        let status = LinkStatus {
            is_connected: state.connected,
            is_bluetooth_enabled: state.bluetooth_enabled,
            is_ble_supported: true,
            current_device: state.current.clone(),
        };
        // A query-induced drop lasts for exactly one status check.
        if state.transient_drop {
            state.transient_drop = false;
            state.connected = true;
        }
        Ok(status)
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
