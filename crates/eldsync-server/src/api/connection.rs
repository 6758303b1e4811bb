//! Connection API endpoints.
//!
//! Start, inspect and drop the ELD connection. History sync starts on its
//! own once a connection is ready, so there is no separate "sync" call.

use axum::extract::State;
use axum::Json;
use eldsync_core::{is_valid_mac_address, ConnectionSnapshot, LinkStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to connect to an ELD.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "address": "C4:A8:28:43:14:9A" }))]
pub struct ConnectRequest {
    /// Bluetooth MAC address of the ELD.
    #[schema(example = "C4:A8:28:43:14:9A")]
    pub address: String,
}

/// Connection state report.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectionResponse {
    /// State machine state and session bookkeeping.
    pub connection: ConnectionSnapshot,

    /// Whether a history sync is running.
    pub is_syncing: bool,

    /// Driver connectivity, if the driver could report it.
    #[schema(nullable)]
    pub link: Option<LinkStatus>,
}

async fn connection_report(state: &SharedState) -> ConnectionResponse {
    let orchestrator = state.orchestrator();
    let link = match orchestrator.link_status().await {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(error = %err, "link status unavailable");
            None
        }
    };
    ConnectionResponse {
        connection: orchestrator.connection_snapshot(),
        is_syncing: orchestrator.is_syncing(),
        link,
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the current connection state.
#[utoipa::path(
    get,
    path = "/api/connection",
    tag = "connection",
    operation_id = "getConnectionState",
    summary = "Get the ELD connection state",
    responses(
        (status = 200, description = "Current connection state", body = ConnectionResponse)
    )
)]
pub async fn get_connection(State(state): State<SharedState>) -> Json<ConnectionResponse> {
    Json(connection_report(&state).await)
}

/// Connect to an ELD and wait until it is ready or has failed.
#[utoipa::path(
    post,
    path = "/api/connection",
    tag = "connection",
    operation_id = "startConnection",
    summary = "Connect to an ELD",
    description = "Connects and authenticates to the ELD at the given address. \
        Returns once the connection is ready; history sync then starts in the \
        background.",
    request_body = ConnectRequest,
    responses(
        (status = 200, description = "Connection is ready", body = ConnectionResponse),
        (status = 400, description = "Invalid Bluetooth address", body = crate::api::error::ErrorResponse),
        (status = 404, description = "Device not found", body = crate::api::error::ErrorResponse),
        (status = 409, description = "Connection already in progress", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Connect or authentication failed", body = crate::api::error::ErrorResponse),
        (status = 503, description = "Bluetooth unavailable", body = crate::api::error::ErrorResponse),
        (status = 504, description = "Connect or authentication timed out", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn start_connection(
    State(state): State<SharedState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Json<ConnectionResponse>> {
    let address = request.address.trim().to_uppercase();
    if !is_valid_mac_address(&address) {
        return Err(ApiError::BadRequest {
            error_code: "invalid_bluetooth_address".to_string(),
            message: format!("Invalid Bluetooth MAC address: {}", request.address),
        });
    }

    info!(%address, "connection requested");
    state.orchestrator().start_connection(&address).await?;
    Ok(Json(connection_report(&state).await))
}

/// Cancel sync and disconnect.
#[utoipa::path(
    delete,
    path = "/api/connection",
    tag = "connection",
    operation_id = "disconnect",
    summary = "Disconnect from the ELD",
    responses(
        (status = 200, description = "Disconnected", body = ConnectionResponse),
        (status = 502, description = "Driver refused to disconnect", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn disconnect(State(state): State<SharedState>) -> ApiResult<Json<ConnectionResponse>> {
    state.orchestrator().disconnect().await?;
    Ok(Json(connection_report(&state).await))
}
