//! Device scanning endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use eldsync_core::{ConnectionState, DiscoveredDevice};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Devices found so far.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "devices": [
        { "address": "C4:A8:28:43:14:9A", "name": "KD032-43149A", "rssi": -61 }
    ],
    "is_scanning": true
}))]
pub struct DevicesResponse {
    /// Devices that passed the name filter.
    pub devices: Vec<DiscoveredDevice>,

    /// Whether a scan is running.
    pub is_scanning: bool,
}

fn devices_report(state: &SharedState) -> DevicesResponse {
    let orchestrator = state.orchestrator();
    DevicesResponse {
        devices: orchestrator.discovered_devices(),
        is_scanning: orchestrator.connection_state() == ConnectionState::Scanning,
    }
}

/// List discovered devices.
#[utoipa::path(
    get,
    path = "/api/devices",
    tag = "devices",
    operation_id = "getDiscoveredDevices",
    summary = "List discovered ELDs",
    responses(
        (status = 200, description = "Discovered devices", body = DevicesResponse)
    )
)]
pub async fn list_devices(State(state): State<SharedState>) -> Json<DevicesResponse> {
    Json(devices_report(&state))
}

/// Start a scan. It stops by itself after the configured scan window.
#[utoipa::path(
    post,
    path = "/api/devices/scan",
    tag = "devices",
    operation_id = "startScan",
    summary = "Scan for ELDs",
    responses(
        (status = 202, description = "Scan started", body = DevicesResponse),
        (status = 409, description = "A connection is in progress", body = crate::api::error::ErrorResponse),
        (status = 503, description = "Bluetooth unavailable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn start_scan(
    State(state): State<SharedState>,
) -> ApiResult<(StatusCode, Json<DevicesResponse>)> {
    state.orchestrator().start_scan().await?;
    Ok((StatusCode::ACCEPTED, Json(devices_report(&state))))
}

/// Stop a running scan.
#[utoipa::path(
    delete,
    path = "/api/devices/scan",
    tag = "devices",
    operation_id = "stopScan",
    summary = "Stop scanning",
    responses(
        (status = 200, description = "Scan stopped", body = DevicesResponse)
    )
)]
pub async fn stop_scan(State(state): State<SharedState>) -> ApiResult<Json<DevicesResponse>> {
    state.orchestrator().stop_scan().await?;
    Ok(Json(devices_report(&state)))
}
