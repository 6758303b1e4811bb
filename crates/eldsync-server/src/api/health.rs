//! Health check API endpoint.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "connection_state": "ready",
    "is_syncing": false,
    "uptime_secs": 3600
}))]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Name of the current connection state.
    #[schema(example = "ready")]
    pub connection_state: String,

    /// Whether a history sync is running.
    pub is_syncing: bool,

    /// Seconds since the server started.
    #[schema(example = 3600)]
    pub uptime_secs: u64,
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns service status, the current ELD connection state and \
        whether a history sync is running.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let orchestrator = state.orchestrator();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connection_state: orchestrator.connection_state().name().to_string(),
        is_syncing: orchestrator.is_syncing(),
        uptime_secs: state.uptime_secs(),
    })
}
