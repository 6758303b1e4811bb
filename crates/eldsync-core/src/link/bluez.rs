//! BlueZ GATT driver.
//!
//! Talks to a KD032/PT30 ELD over the vendor serial service. Commands are
//! written to the `ffe1` characteristic and every reply or live sample comes
//! back as a notification on the same characteristic.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session, Uuid};
use futures::{pin_mut, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    event_from_notification, ConnectOutcome, DeviceLink, DiscoveredDevice, HistoryKind, LinkError,
    LinkEvent, LinkResult, LinkStatus, EVENT_CHANNEL_CAPACITY,
};
use crate::config::DeviceConfig;
use crate::packet::Command;

/// Vendor serial service.
pub const SERIAL_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb);
/// Command/notification characteristic of the serial service.
pub const SERIAL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb);

/// Status reported when BlueZ refuses a connection.
const CONNECT_FAILED_STATUS: i32 = -1;
const SERVICES_POLL: Duration = Duration::from_millis(500);
const SERVICES_MAX_POLLS: u32 = 30;

#[derive(Debug, Default)]
struct BluezState {
    scan: Option<CancellationToken>,
    device: Option<Device>,
    serial: Option<Characteristic>,
    session: Option<CancellationToken>,
}

/// [`DeviceLink`] backed by the host's default BlueZ adapter.
pub struct BluezLink {
    _session: Session,
    adapter: Adapter,
    credentials: Option<(String, String)>,
    events: broadcast::Sender<LinkEvent>,
    state: Arc<Mutex<BluezState>>,
}

impl std::fmt::Debug for BluezLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezLink")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

fn transport(err: &bluer::Error) -> LinkError {
    LinkError::Transport {
        message: err.to_string(),
    }
}

impl BluezLink {
    /// Open a BlueZ session on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::BleUnsupported`] if bluetoothd or an adapter is
    /// unavailable.
    pub async fn new(device: &DeviceConfig) -> LinkResult<Self> {
        let session = Session::new().await.map_err(|err| {
            warn!(error = %err, "cannot open BlueZ session");
            LinkError::BleUnsupported
        })?;
        let adapter = session.default_adapter().await.map_err(|err| {
            warn!(error = %err, "no Bluetooth adapter");
            LinkError::BleUnsupported
        })?;
        info!(adapter = adapter.name(), "using Bluetooth adapter");

        let credentials = device.imei.clone().zip(device.passcode.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            _session: session,
            adapter,
            credentials,
            events,
            state: Arc::new(Mutex::new(BluezState::default())),
        })
    }

    fn state(&self) -> MutexGuard<'_, BluezState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn ensure_powered(&self) -> LinkResult<()> {
        match self.adapter.is_powered().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LinkError::BluetoothDisabled),
            Err(err) => Err(transport(&err)),
        }
    }

    async fn serial_characteristic(device: &Device) -> LinkResult<Characteristic> {
        let mut polls = 0;
        while !device.is_services_resolved().await.map_err(|e| transport(&e))? {
            polls += 1;
            if polls >= SERVICES_MAX_POLLS {
                return Err(LinkError::Transport {
                    message: "GATT services never resolved".to_string(),
                });
            }
            tokio::time::sleep(SERVICES_POLL).await;
        }

        for service in device.services().await.map_err(|e| transport(&e))? {
            if service.uuid().await.map_err(|e| transport(&e))? != SERIAL_SERVICE_UUID {
                continue;
            }
            for characteristic in service.characteristics().await.map_err(|e| transport(&e))? {
                if characteristic.uuid().await.map_err(|e| transport(&e))?
                    == SERIAL_CHARACTERISTIC_UUID
                {
                    return Ok(characteristic);
                }
            }
        }
        Err(LinkError::CommandRejected {
            message: "device has no ELD serial characteristic".to_string(),
        })
    }

    async fn start_session(&self, device: &Device, serial: &Characteristic) -> LinkResult<()> {
        let notifications = serial.notify().await.map_err(|e| transport(&e))?;
        let device_events = device.events().await.map_err(|e| transport(&e))?;

        let token = CancellationToken::new();
        if let Some(previous) = self.state().session.replace(token.clone()) {
            previous.cancel();
        }

        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            pin_mut!(notifications);
            pin_mut!(device_events);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    value = notifications.next() => {
                        let Some(value) = value else { break };
                        debug!(len = value.len(), "notification");
                        let _ = events.send(event_from_notification(&value));
                    }
                    event = device_events.next() => match event {
                        Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
                            info!("ELD dropped the link");
                            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                            guard.device = None;
                            guard.serial = None;
                            guard.session = None;
                            drop(guard);
                            let _ = events.send(LinkEvent::Disconnected);
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }
            debug!("notification session ended");
        });
        Ok(())
    }

    async fn write(&self, command: &Command) -> LinkResult<()> {
        let serial = self.state().serial.clone().ok_or(LinkError::NotConnected)?;
        serial
            .write(&command.encode())
            .await
            .map_err(|e| transport(&e))
    }
}

#[async_trait]
impl DeviceLink for BluezLink {
    async fn start_scan(&self) -> LinkResult<()> {
        self.ensure_powered().await?;
        let discovery = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| transport(&e))?;

        let token = CancellationToken::new();
        if let Some(previous) = self.state().scan.replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            pin_mut!(discovery);
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = discovery.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                let found = DiscoveredDevice {
                    address: address.to_string(),
                    name: device.name().await.ok().flatten(),
                    rssi: device.rssi().await.ok().flatten(),
                };
                debug!(address = %found.address, name = ?found.name, "device found");
                let _ = events.send(LinkEvent::DeviceFound(found));
            }
            debug!("discovery stopped");
        });
        Ok(())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        if let Some(scan) = self.state().scan.take() {
            scan.cancel();
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> LinkResult<ConnectOutcome> {
        self.ensure_powered().await?;
        let parsed: Address = address.parse().map_err(|_| LinkError::DeviceNotFound {
            address: address.to_string(),
        })?;
        let device = self
            .adapter
            .device(parsed)
            .map_err(|_| LinkError::DeviceNotFound {
                address: address.to_string(),
            })?;

        if let Err(err) = device.connect().await {
            warn!(address, error = %err, "connect failed");
            let _ = self.events.send(LinkEvent::ConnectFailure {
                status: CONNECT_FAILED_STATUS,
            });
            return Ok(ConnectOutcome::Failure {
                status: CONNECT_FAILED_STATUS,
            });
        }
        info!(address, "link established");
        let _ = self.events.send(LinkEvent::Connected);

        let serial = match Self::serial_characteristic(&device).await {
            Ok(serial) => serial,
            Err(err) => {
                let _ = device.disconnect().await;
                return Err(err);
            }
        };
        self.start_session(&device, &serial).await?;
        {
            let mut state = self.state();
            state.device = Some(device);
            state.serial = Some(serial);
        }

        match &self.credentials {
            Some((imei, passcode)) => self.write(&Command::authenticate(imei, passcode)).await?,
            None => {
                debug!("no credentials configured, skipping authentication");
                let _ = self
                    .events
                    .send(LinkEvent::AuthenticationPassed { device_id: None });
            }
        }
        Ok(ConnectOutcome::Connected)
    }

    async fn disconnect(&self) -> LinkResult<()> {
        let (device, session) = {
            let mut state = self.state();
            state.serial = None;
            (state.device.take(), state.session.take())
        };
        if let Some(session) = session {
            session.cancel();
        }
        if let Some(device) = device {
            device.disconnect().await.map_err(|e| transport(&e))?;
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
        debug!(kind = kind.as_str(), formatted_start, formatted_end, "writing history query");
        self.write(&Command::query_history(
            kind.code(),
            formatted_start,
            formatted_end,
        ))
        .await
    }

    async fn connection_status(&self) -> LinkResult<LinkStatus> {
        let powered = self.adapter.is_powered().await.unwrap_or(false);
        let device = self.state().device.clone();
        let (is_connected, current_device) = match device {
            Some(device) => {
                let connected = device.is_connected().await.unwrap_or(false);
                (connected, connected.then(|| device.address().to_string()))
            }
            None => (false, None),
        };
        Ok(LinkStatus {
            is_connected,
            is_bluetooth_enabled: powered,
            is_ble_supported: true,
            current_device,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }
}
