//! Connection lifecycle.
//!
//! [`ConnectionStateMachine`] is a pure transition function over
//! [`ConnectionState`]: it owns the [`ConnectionSession`] bookkeeping and the
//! set of discovered devices, and never touches the radio.
//!
//! [`ConnectionManager`] drives a [`DeviceLink`](crate::link::DeviceLink)
//! through scan, connect and authenticate, feeds link events into the
//! machine, enforces the connect and authentication timeouts and publishes
//! every change on a `watch` channel. [`ConnectionState::Ready`] is the only
//! signal that history sync may begin.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::link::{matches_name_filter, ConnectOutcome, DiscoveredDevice, LinkEvent, SharedLink};

/// A connection step with its own time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for the link to come up.
    Connect,
    /// Waiting for the device to accept our credentials.
    Authentication,
}

impl Phase {
    /// Name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Authentication => "authentication",
        }
    }
}

/// Why a connection attempt ended in [`ConnectionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The driver reported a connect failure.
    ConnectFailed {
        /// Driver status code.
        status: i32,
    },
    /// The device rejected authentication.
    AuthenticationRejected {
        /// Device-provided reason.
        reason: String,
    },
    /// A step ran out of time.
    Timeout {
        /// The step that timed out.
        phase: Phase,
    },
    /// The driver errored during the attempt.
    Link {
        /// Driver-provided detail.
        message: String,
    },
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing happening.
    #[default]
    Idle,
    /// Looking for devices.
    Scanning,
    /// A device was picked but not yet connected.
    DeviceSelected,
    /// Link is being established.
    Connecting,
    /// Link is up, authentication not started.
    Connected,
    /// Waiting for the device to accept our credentials.
    Authenticating,
    /// Connected, authenticated and verified; sync may begin.
    Ready,
    /// The link went down.
    Disconnected,
    /// The attempt failed.
    Failed {
        /// What went wrong.
        reason: FailureReason,
    },
}

impl ConnectionState {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::DeviceSelected => "device_selected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether a connection attempt is underway (link requested but not yet
    /// ready).
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Authenticating)
    }

    /// Whether the attempt reached an end state that needs a reset before
    /// trying again.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed { .. })
    }

    const fn holds_link(&self) -> bool {
        self.is_in_progress() || matches!(self, Self::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Begin scanning.
    StartScan,
    /// A scan reported a device.
    DeviceFound(DiscoveredDevice),
    /// Caller stopped the scan.
    StopScan,
    /// The scan ran out of time.
    ScanFinished,
    /// Caller picked a device.
    SelectDevice(String),
    /// Caller asked to connect to an address.
    Connect(String),
    /// The link came up.
    LinkEstablished,
    /// The driver reported a connect failure.
    ConnectFailure {
        /// Driver status code.
        status: i32,
    },
    /// Authentication started.
    BeginAuthentication,
    /// Authentication passed and the link was verified.
    AuthenticationPassed {
        /// Device id reported by the device.
        device_id: Option<String>,
    },
    /// Authentication was rejected.
    AuthenticationFailed {
        /// Device-provided reason.
        reason: String,
    },
    /// The driver errored during an attempt.
    LinkFault {
        /// Driver-provided detail.
        message: String,
    },
    /// A step ran out of time.
    Timeout(Phase),
    /// The link went down.
    Disconnected,
    /// Return to idle after a finished attempt.
    Reset,
}

impl ConnectionEvent {
    /// Short name for logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StartScan => "start_scan",
            Self::DeviceFound(_) => "device_found",
            Self::StopScan => "stop_scan",
            Self::ScanFinished => "scan_finished",
            Self::SelectDevice(_) => "select_device",
            Self::Connect(_) => "connect",
            Self::LinkEstablished => "link_established",
            Self::ConnectFailure { .. } => "connect_failure",
            Self::BeginAuthentication => "begin_authentication",
            Self::AuthenticationPassed { .. } => "authentication_passed",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::LinkFault { .. } => "link_fault",
            Self::Timeout(_) => "timeout",
            Self::Disconnected => "disconnected",
            Self::Reset => "reset",
        }
    }
}

/// Bookkeeping for the current (or last) connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSession {
    /// Address of the device being connected to.
    pub device_address: Option<String>,
    /// Connect attempts made to this address.
    pub connect_attempt_count: u32,
    /// When the latest connect attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When the link last came up.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// When the link last went down.
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// Device id reported by the last successful authentication.
    pub last_known_device_id: Option<String>,
    /// Incremented on every connect attempt; identifies a connection session.
    pub generation: u64,
}

/// Pure connection state machine.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    session: ConnectionSession,
    selected: Option<String>,
    discovered: BTreeMap<String, DiscoveredDevice>,
}

impl ConnectionStateMachine {
    /// A machine in [`ConnectionState::Idle`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Session bookkeeping.
    #[must_use]
    pub const fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Address picked by `SelectDevice`, if any.
    #[must_use]
    pub fn selected_device(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Devices seen by scans, ordered by address.
    #[must_use]
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.discovered.values().cloned().collect()
    }

    /// Apply `event` at `now`.
    ///
    /// Returns `Ok(Some(state))` when the state changed, `Ok(None)` when the
    /// event was absorbed (bookkeeping only, or a duplicate notification for
    /// a phase already passed).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTransition`] if `event` is illegal in the
    /// current state. The machine is left unchanged.
    pub fn apply(
        &mut self,
        event: ConnectionEvent,
        now: DateTime<Utc>,
    ) -> Result<Option<ConnectionState>> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (&self.state, event) {
            (_, E::DeviceFound(device)) => {
                self.discovered.insert(device.address.clone(), device);
                None
            }

            (S::Idle, E::StartScan) => Some(S::Scanning),
            (S::Scanning, E::StartScan) => None,

            (S::Scanning, E::StopScan | E::ScanFinished) => Some(S::Idle),
            (_, E::StopScan | E::ScanFinished) => None,

            (S::Idle | S::Scanning | S::DeviceSelected, E::SelectDevice(address)) => {
                self.selected = Some(address);
                Some(S::DeviceSelected)
            }

            (S::Idle | S::Scanning | S::DeviceSelected, E::Connect(address)) => {
                if self.session.device_address.as_deref() != Some(address.as_str()) {
                    self.session.connect_attempt_count = 0;
                    self.session.last_known_device_id = None;
                }
                self.session.device_address = Some(address.clone());
                self.session.connect_attempt_count += 1;
                self.session.last_attempt_at = Some(now);
                self.session.generation += 1;
                self.selected = Some(address);
                Some(S::Connecting)
            }

            (S::Connecting, E::LinkEstablished) => {
                self.session.last_connected_at = Some(now);
                Some(S::Connected)
            }
            (S::Connected | S::Authenticating | S::Ready, E::LinkEstablished) => None,

            (S::Connecting, E::ConnectFailure { status }) => Some(S::Failed {
                reason: FailureReason::ConnectFailed { status },
            }),
            (S::Failed { .. }, E::ConnectFailure { .. }) => None,

            (S::Connected, E::BeginAuthentication) => Some(S::Authenticating),
            (S::Authenticating | S::Ready, E::BeginAuthentication) => None,

            (
                S::Connecting | S::Connected | S::Authenticating,
                E::AuthenticationPassed { device_id },
            ) => {
                if self.session.last_connected_at.is_none()
                    || matches!(self.state, S::Connecting)
                {
                    self.session.last_connected_at = Some(now);
                }
                if device_id.is_some() {
                    self.session.last_known_device_id = device_id;
                }
                Some(S::Ready)
            }
            (S::Ready, E::AuthenticationPassed { .. }) => None,

            (
                S::Connecting | S::Connected | S::Authenticating,
                E::AuthenticationFailed { reason },
            ) => Some(S::Failed {
                reason: FailureReason::AuthenticationRejected { reason },
            }),

            (S::Connecting | S::Connected | S::Authenticating, E::LinkFault { message }) => {
                Some(S::Failed {
                    reason: FailureReason::Link { message },
                })
            }

            (S::Connecting | S::Connected | S::Authenticating, E::Timeout(phase)) => {
                Some(S::Failed {
                    reason: FailureReason::Timeout { phase },
                })
            }
            // A timer that fired after the phase it guarded was left.
            (S::Ready | S::Disconnected | S::Failed { .. }, E::Timeout(_)) => None,

            (state, E::Disconnected) if state.holds_link() => {
                self.session.last_disconnected_at = Some(now);
                Some(S::Disconnected)
            }
            (_, E::Disconnected) => None,

            (S::Disconnected | S::Failed { .. }, E::Reset) => {
                self.selected = None;
                Some(S::Idle)
            }
            (S::Idle, E::Reset) => None,

            (state, event) => {
                return Err(SyncError::InvalidTransition {
                    state: state.name().to_string(),
                    event: event.name().to_string(),
                });
            }
        };

        match next {
            Some(state) if state != self.state => {
                self.state = state.clone();
                Ok(Some(state))
            }
            _ => Ok(None),
        }
    }
}

/// Connection state plus the session it belongs to, as published to
/// observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConnectionSnapshot {
    /// Current state.
    #[serde(flatten)]
    pub state: ConnectionState,
    /// Session bookkeeping at the time of the change.
    pub session: ConnectionSession,
}

/// Time budgets for the connection steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// Budget for the link to come up.
    pub connect: Duration,
    /// Budget for authentication after the link is up.
    pub authentication: Duration,
}

impl ConnectionTimeouts {
    const fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::Connect => self.connect,
            Phase::Authentication => self.authentication,
        }
    }
}

/// Drives a device link through the connection lifecycle.
pub struct ConnectionManager {
    link: SharedLink,
    timeouts: ConnectionTimeouts,
    name_prefixes: Vec<String>,
    machine: Mutex<ConnectionStateMachine>,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("timeouts", &self.timeouts)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager over `link` using the connection and device sections
    /// of `config`.
    #[must_use]
    pub fn new(link: SharedLink, config: &Config) -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        Self {
            link,
            timeouts: ConnectionTimeouts {
                connect: Duration::from_secs(config.connection.connect_timeout_secs),
                authentication: Duration::from_secs(config.connection.auth_timeout_secs),
            },
            name_prefixes: config.device.name_prefixes.clone(),
            machine: Mutex::new(ConnectionStateMachine::new()),
            snapshot,
        }
    }

    fn machine(&self) -> MutexGuard<'_, ConnectionStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.machine().state().clone()
    }

    /// Current session bookkeeping.
    #[must_use]
    pub fn session(&self) -> ConnectionSession {
        self.machine().session().clone()
    }

    /// Devices seen by scans that pass the name filter.
    #[must_use]
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.machine().discovered()
    }

    /// Watch state changes. The current value is available immediately.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Apply an event and publish the result if the state changed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTransition`] if the event is illegal now.
    pub fn apply(&self, event: ConnectionEvent) -> Result<Option<ConnectionState>> {
        let name = event.name();
        let mut machine = self.machine();
        let from = machine.state().name();
        let changed = machine.apply(event, Utc::now())?;

        if let Some(state) = &changed {
            debug!(from, to = state.name(), event = name, "connection state changed");
            let snapshot = ConnectionSnapshot {
                state: state.clone(),
                session: machine.session().clone(),
            };
            self.snapshot.send_replace(snapshot);
        }
        Ok(changed)
    }

    /// Apply an event whose rejection only means it arrived late.
    fn apply_quietly(&self, event: ConnectionEvent) {
        if let Err(err) = self.apply(event) {
            debug!(error = %err, "ignoring stale connection event");
        }
    }

    fn reset_if_finished(&self) {
        if self.state().is_finished() {
            self.apply_quietly(ConnectionEvent::Reset);
        }
    }

    const fn timeout_error(&self, phase: Phase) -> SyncError {
        SyncError::Timeout {
            phase: phase.as_str(),
            secs: self.timeouts.for_phase(phase).as_secs(),
        }
    }

    fn failure_error(&self, reason: &FailureReason) -> SyncError {
        match reason {
            FailureReason::ConnectFailed { status } => SyncError::ConnectFailed { status: *status },
            FailureReason::AuthenticationRejected { reason } => {
                SyncError::AuthenticationFailed(reason.clone())
            }
            FailureReason::Timeout { phase } => self.timeout_error(*phase),
            FailureReason::Link { message } => SyncError::Link(message.clone()),
        }
    }

    /// Start scanning. Found devices arrive through [`handle_link_event`].
    ///
    /// # Errors
    ///
    /// Returns an error if a connection is in progress or the link refuses to
    /// scan.
    ///
    /// [`handle_link_event`]: Self::handle_link_event
    pub async fn start_scan(&self) -> Result<()> {
        self.reset_if_finished();
        self.apply(ConnectionEvent::StartScan)?;
        if let Err(err) = self.link.start_scan().await {
            self.apply_quietly(ConnectionEvent::StopScan);
            return Err(err.into());
        }
        info!("scanning for ELD devices");
        Ok(())
    }

    /// Stop scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if the link refuses to stop.
    pub async fn stop_scan(&self) -> Result<()> {
        self.link.stop_scan().await?;
        self.apply(ConnectionEvent::StopScan)?;
        Ok(())
    }

    /// End a scan because its time budget ran out.
    ///
    /// # Errors
    ///
    /// Returns an error if the link refuses to stop.
    pub async fn finish_scan(&self) -> Result<()> {
        if self.state() != ConnectionState::Scanning {
            return Ok(());
        }
        self.link.stop_scan().await?;
        self.apply(ConnectionEvent::ScanFinished)?;
        debug!("scan window elapsed");
        Ok(())
    }

    /// Pick a device without connecting yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection is in progress.
    pub fn select_device(&self, address: &str) -> Result<()> {
        self.reset_if_finished();
        self.apply(ConnectionEvent::SelectDevice(address.to_string()))?;
        Ok(())
    }

    /// Connect and authenticate to `address`, resolving once the attempt
    /// settles.
    ///
    /// Authentication results are delivered as link events, so the caller
    /// must be forwarding events to [`handle_link_event`] concurrently.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt did not reach [`ConnectionState::Ready`].
    /// Nothing is retried.
    ///
    /// [`handle_link_event`]: Self::handle_link_event
    pub async fn connect(&self, address: &str) -> Result<ConnectionState> {
        self.reset_if_finished();
        if self.state() == ConnectionState::Scanning {
            if let Err(err) = self.link.stop_scan().await {
                warn!(error = %err, "failed to stop scan before connecting");
            }
        }
        self.apply(ConnectionEvent::Connect(address.to_string()))?;
        let mut updates = self.subscribe();
        info!(address, "connecting to ELD");

        let outcome = tokio::time::timeout(self.timeouts.connect, self.link.connect(address)).await;
        match outcome {
            Err(_) => {
                warn!(address, "connect timed out");
                self.apply_quietly(ConnectionEvent::Timeout(Phase::Connect));
                return Err(self.timeout_error(Phase::Connect));
            }
            Ok(Err(err)) => {
                let err = SyncError::from(err);
                warn!(address, error = %err, "connect failed");
                self.apply_quietly(ConnectionEvent::LinkFault {
                    message: err.to_string(),
                });
                return Err(err);
            }
            Ok(Ok(ConnectOutcome::Failure { status })) => {
                warn!(address, status, "ELD refused connection");
                self.apply_quietly(ConnectionEvent::ConnectFailure { status });
                return Err(SyncError::ConnectFailed { status });
            }
            Ok(Ok(ConnectOutcome::Connected)) => {
                self.apply_quietly(ConnectionEvent::LinkEstablished);
                self.apply_quietly(ConnectionEvent::BeginAuthentication);
            }
        }

        let settled = tokio::time::timeout(
            self.timeouts.authentication,
            updates.wait_for(|snapshot| {
                matches!(
                    snapshot.state,
                    ConnectionState::Ready
                        | ConnectionState::Disconnected
                        | ConnectionState::Failed { .. }
                        | ConnectionState::Idle
                )
            }),
        )
        .await;

        let state = match settled {
            Ok(Ok(snapshot)) => snapshot.state.clone(),
            Ok(Err(_)) => return Err(SyncError::UnexpectedDisconnect),
            Err(_) => {
                warn!(address, "authentication timed out");
                self.apply_quietly(ConnectionEvent::Timeout(Phase::Authentication));
                return Err(self.timeout_error(Phase::Authentication));
            }
        };

        match state {
            ConnectionState::Ready => {
                info!(address, "ELD ready");
                Ok(state)
            }
            ConnectionState::Failed { reason } => Err(self.failure_error(&reason)),
            _ => Err(SyncError::UnexpectedDisconnect),
        }
    }

    /// Drop the current connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the link refuses to disconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.link.disconnect().await?;
        self.apply_quietly(ConnectionEvent::Disconnected);
        info!("disconnected from ELD");
        Ok(())
    }

    /// Feed one inbound link event into the machine.
    ///
    /// `AuthenticationPassed` is only honoured after a fresh connectivity
    /// check confirms the link; a link that dropped in the meantime moves the
    /// machine to [`ConnectionState::Disconnected`] instead of `Ready`.
    pub async fn handle_link_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::DeviceFound(device) => {
                if matches_name_filter(device, &self.name_prefixes) {
                    debug!(address = %device.address, name = ?device.name, rssi = ?device.rssi, "device found");
                    self.apply_quietly(ConnectionEvent::DeviceFound(device.clone()));
                }
            }
            LinkEvent::Connected => self.apply_quietly(ConnectionEvent::LinkEstablished),
            LinkEvent::ConnectFailure { status } => {
                self.apply_quietly(ConnectionEvent::ConnectFailure { status: *status });
            }
            LinkEvent::AuthenticationPassed { device_id } => {
                if !self.state().is_in_progress() {
                    debug!(state = %self.state(), "ignoring authentication outside an attempt");
                    return;
                }
                match self.link.connection_status().await {
                    Ok(status) if status.is_connected => {
                        self.apply_quietly(ConnectionEvent::AuthenticationPassed {
                            device_id: device_id.clone(),
                        });
                    }
                    Ok(status) => {
                        warn!(
                            bluetooth_enabled = status.is_bluetooth_enabled,
                            "link lost right after authentication"
                        );
                        self.apply_quietly(ConnectionEvent::Disconnected);
                    }
                    Err(err) => {
                        warn!(error = %err, "connectivity check after authentication failed");
                        self.apply_quietly(ConnectionEvent::Disconnected);
                    }
                }
            }
            LinkEvent::AuthenticationFailed { reason } => {
                warn!(reason = %reason, "ELD rejected authentication");
                self.apply_quietly(ConnectionEvent::AuthenticationFailed {
                    reason: reason.clone(),
                });
            }
            LinkEvent::Disconnected => self.apply_quietly(ConnectionEvent::Disconnected),
            LinkEvent::Error { message } => warn!(message = %message, "device link error"),
            LinkEvent::Telemetry(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::link::mock::{AuthBehaviour, MockLink};
    use crate::link::DeviceLink;

    const ADDRESS: &str = "C4:A8:28:43:14:9A";

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn ready_machine() -> ConnectionStateMachine {
        let mut machine = ConnectionStateMachine::new();
        machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .unwrap();
        machine.apply(ConnectionEvent::LinkEstablished, now()).unwrap();
        machine
            .apply(ConnectionEvent::BeginAuthentication, now())
            .unwrap();
        machine
            .apply(
                ConnectionEvent::AuthenticationPassed {
                    device_id: Some("PT30-ELD-001".into()),
                },
                now(),
            )
            .unwrap();
        machine
    }

    #[test]
    fn test_happy_path_reaches_ready() {
        let machine = ready_machine();
        assert_eq!(machine.state(), &ConnectionState::Ready);
        assert_eq!(machine.session().connect_attempt_count, 1);
        assert_eq!(machine.session().generation, 1);
        assert_eq!(
            machine.session().last_known_device_id.as_deref(),
            Some("PT30-ELD-001")
        );
        assert!(machine.session().last_connected_at.is_some());
    }

    #[test]
    fn test_scan_and_select() {
        let mut machine = ConnectionStateMachine::new();
        assert_eq!(
            machine.apply(ConnectionEvent::StartScan, now()).unwrap(),
            Some(ConnectionState::Scanning)
        );

        let device = DiscoveredDevice {
            address: ADDRESS.into(),
            name: Some("KD032-43149A".into()),
            rssi: Some(-70),
        };
        assert_eq!(
            machine
                .apply(ConnectionEvent::DeviceFound(device.clone()), now())
                .unwrap(),
            None
        );
        let closer = DiscoveredDevice {
            rssi: Some(-50),
            ..device
        };
        machine
            .apply(ConnectionEvent::DeviceFound(closer), now())
            .unwrap();
        assert_eq!(machine.discovered().len(), 1);
        assert_eq!(machine.discovered()[0].rssi, Some(-50));

        machine
            .apply(ConnectionEvent::SelectDevice(ADDRESS.into()), now())
            .unwrap();
        assert_eq!(machine.state(), &ConnectionState::DeviceSelected);
        assert_eq!(machine.selected_device(), Some(ADDRESS));

        machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .unwrap();
        assert_eq!(machine.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn test_stop_scan_returns_to_idle() {
        let mut machine = ConnectionStateMachine::new();
        machine.apply(ConnectionEvent::StartScan, now()).unwrap();
        assert_eq!(
            machine.apply(ConnectionEvent::ScanFinished, now()).unwrap(),
            Some(ConnectionState::Idle)
        );
    }

    #[test]
    fn test_connect_failure_and_reset() {
        let mut machine = ConnectionStateMachine::new();
        machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .unwrap();
        machine
            .apply(ConnectionEvent::ConnectFailure { status: 133 }, now())
            .unwrap();
        assert_eq!(
            machine.state(),
            &ConnectionState::Failed {
                reason: FailureReason::ConnectFailed { status: 133 }
            }
        );

        machine.apply(ConnectionEvent::Reset, now()).unwrap();
        machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .unwrap();
        assert_eq!(machine.session().connect_attempt_count, 2);
        assert_eq!(machine.session().generation, 2);
    }

    #[test]
    fn test_attempt_count_restarts_for_a_new_address() {
        let mut machine = ConnectionStateMachine::new();
        machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .unwrap();
        machine
            .apply(ConnectionEvent::Timeout(Phase::Connect), now())
            .unwrap();
        machine.apply(ConnectionEvent::Reset, now()).unwrap();
        machine
            .apply(ConnectionEvent::Connect("00:11:22:33:44:55".into()), now())
            .unwrap();
        assert_eq!(machine.session().connect_attempt_count, 1);
    }

    #[test]
    fn test_timeouts_fail_in_progress_states() {
        for steps in [0, 1, 2] {
            let mut machine = ConnectionStateMachine::new();
            machine
                .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
                .unwrap();
            if steps >= 1 {
                machine.apply(ConnectionEvent::LinkEstablished, now()).unwrap();
            }
            if steps >= 2 {
                machine
                    .apply(ConnectionEvent::BeginAuthentication, now())
                    .unwrap();
            }
            machine
                .apply(ConnectionEvent::Timeout(Phase::Authentication), now())
                .unwrap();
            assert!(matches!(
                machine.state(),
                ConnectionState::Failed {
                    reason: FailureReason::Timeout { .. }
                }
            ));
        }
    }

    #[test]
    fn test_stale_timeout_after_ready_is_ignored() {
        let mut machine = ready_machine();
        assert_eq!(
            machine
                .apply(ConnectionEvent::Timeout(Phase::Authentication), now())
                .unwrap(),
            None
        );
        assert_eq!(machine.state(), &ConnectionState::Ready);
    }

    #[test]
    fn test_authentication_reported_while_connecting() {
        let mut machine = ConnectionStateMachine::new();
        machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .unwrap();
        machine
            .apply(
                ConnectionEvent::AuthenticationPassed { device_id: None },
                now(),
            )
            .unwrap();
        assert_eq!(machine.state(), &ConnectionState::Ready);
        assert!(machine.session().last_connected_at.is_some());

        // The link-up notification arriving late is a duplicate.
        assert_eq!(
            machine.apply(ConnectionEvent::LinkEstablished, now()).unwrap(),
            None
        );
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut machine = ready_machine();
        for event in [
            ConnectionEvent::LinkEstablished,
            ConnectionEvent::BeginAuthentication,
            ConnectionEvent::AuthenticationPassed { device_id: None },
        ] {
            assert_eq!(machine.apply(event, now()).unwrap(), None);
        }
        assert_eq!(machine.state(), &ConnectionState::Ready);
    }

    #[test]
    fn test_illegal_events_are_rejected() {
        let mut machine = ConnectionStateMachine::new();
        let err = machine
            .apply(ConnectionEvent::BeginAuthentication, now())
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        assert_eq!(machine.state(), &ConnectionState::Idle);

        let mut machine = ready_machine();
        assert!(machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .is_err());
        assert!(machine.apply(ConnectionEvent::Reset, now()).is_err());
    }

    #[test]
    fn test_disconnect_from_ready_and_reset() {
        let mut machine = ready_machine();
        assert_eq!(
            machine.apply(ConnectionEvent::Disconnected, now()).unwrap(),
            Some(ConnectionState::Disconnected)
        );
        assert!(machine.session().last_disconnected_at.is_some());
        assert_eq!(
            machine.apply(ConnectionEvent::Disconnected, now()).unwrap(),
            None
        );
        assert_eq!(
            machine.apply(ConnectionEvent::Reset, now()).unwrap(),
            Some(ConnectionState::Idle)
        );
    }

    #[test]
    fn test_disconnect_keeps_failure_reason() {
        let mut machine = ConnectionStateMachine::new();
        machine
            .apply(ConnectionEvent::Connect(ADDRESS.into()), now())
            .unwrap();
        machine
            .apply(
                ConnectionEvent::AuthenticationFailed {
                    reason: "bad passcode".into(),
                },
                now(),
            )
            .unwrap();
        machine.apply(ConnectionEvent::Disconnected, now()).unwrap();
        assert!(matches!(machine.state(), ConnectionState::Failed { .. }));
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let snapshot = ConnectionSnapshot {
            state: ConnectionState::Failed {
                reason: FailureReason::Timeout {
                    phase: Phase::Authentication,
                },
            },
            session: ConnectionSession::default(),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["state"], "failed");
        assert_eq!(value["reason"]["kind"], "timeout");
        assert_eq!(value["reason"]["phase"], "authentication");
        assert!(value["session"].is_object());
    }

    fn manager_with(link: &Arc<MockLink>) -> Arc<ConnectionManager> {
        let shared: SharedLink = link.clone();
        let manager = Arc::new(ConnectionManager::new(shared, &Config::default()));

        let mut events = link.subscribe();
        let pump = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                pump.handle_link_event(&event).await;
            }
        });
        manager
    }

    #[tokio::test]
    async fn test_manager_connects_to_ready() {
        let link = Arc::new(MockLink::new());
        let manager = manager_with(&link);

        let state = manager.connect(ADDRESS).await.unwrap();
        assert_eq!(state, ConnectionState::Ready);
        assert_eq!(
            manager.session().last_known_device_id.as_deref(),
            Some("PT30-ELD-001")
        );
        assert_eq!(manager.subscribe().borrow().state, ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_link_lost_after_authentication_never_reaches_ready() {
        let link = Arc::new(MockLink::new());
        link.drop_after_authentication();
        let manager = manager_with(&link);
        let mut updates = manager.subscribe();

        let err = manager.connect(ADDRESS).await.unwrap_err();
        assert!(matches!(err, SyncError::UnexpectedDisconnect));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Ready was never published.
        while updates.has_changed().unwrap() {
            assert_ne!(updates.borrow_and_update().state, ConnectionState::Ready);
        }
    }

    #[tokio::test]
    async fn test_failed_status_check_counts_as_disconnected() {
        let link = Arc::new(MockLink::new());
        link.fail_next_status_checks(1);
        let manager = manager_with(&link);

        assert!(manager.connect(ADDRESS).await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_authentication() {
        let link = Arc::new(MockLink::new());
        link.set_auth(AuthBehaviour::Reject("bad passcode".into()));
        let manager = manager_with(&link);

        let err = manager.connect(ADDRESS).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed(ref r) if r == "bad passcode"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let link = Arc::new(MockLink::new());
        link.set_auth(AuthBehaviour::Silent);
        let manager = manager_with(&link);

        let err = manager.connect(ADDRESS).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Timeout {
                phase: "authentication",
                secs: 15
            }
        ));
        assert!(matches!(
            manager.state(),
            ConnectionState::Failed {
                reason: FailureReason::Timeout {
                    phase: Phase::Authentication
                }
            }
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_then_retry_by_caller() {
        let link = Arc::new(MockLink::new());
        link.push_connect_outcome(ConnectOutcome::Failure { status: 8 });
        let manager = manager_with(&link);

        let err = manager.connect(ADDRESS).await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectFailed { status: 8 }));

        assert_eq!(manager.connect(ADDRESS).await.unwrap(), ConnectionState::Ready);
        assert_eq!(manager.session().connect_attempt_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let link = Arc::new(MockLink::new());
        let manager = manager_with(&link);

        let err = manager.connect("00:11:22:33:44:55").await.unwrap_err();
        assert!(matches!(err, SyncError::DeviceNotFound(_)));
        assert!(matches!(manager.state(), ConnectionState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_scan_collects_filtered_devices() {
        let link = Arc::new(MockLink::new());
        let manager = manager_with(&link);

        manager.start_scan().await.unwrap();
        link.inject(LinkEvent::DeviceFound(DiscoveredDevice {
            address: "11:22:33:44:55:66".into(),
            name: Some("Speaker".into()),
            rssi: Some(-40),
        }));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let devices = manager.discovered_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, ADDRESS);
        assert!(link.is_scanning());

        manager.stop_scan().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!link.is_scanning());
    }

    #[tokio::test]
    async fn test_disconnect_after_ready() {
        let link = Arc::new(MockLink::new());
        let manager = manager_with(&link);
        manager.connect(ADDRESS).await.unwrap();

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!link.connection_status().await.unwrap().is_connected);
    }
}
