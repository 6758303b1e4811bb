//! OpenAPI specification for the eldsync API.

use axum::Json;
use eldsync_core::connection::{ConnectionSession, ConnectionSnapshot, ConnectionState, FailureReason};
use eldsync_core::{DiscoveredDevice, LinkStatus, TelemetryRecord};
use utoipa::OpenApi;

use super::connection::{ConnectRequest, ConnectionResponse};
use super::devices::DevicesResponse;
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::sync::{CancelSyncResponse, TimelineResponse};

/// Serve the OpenAPI specification as JSON at `/api/openapi.json`.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// The OpenAPI specification as pretty JSON. Used by the gen-openapi binary.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for eldsync.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "eldsync API",
        version = "0.1.0",
        description = r"
# eldsync API

eldsync keeps a local, duplicate-free timeline of telemetry from a Bluetooth
electronic logging device (ELD).

## Overview

1. **Scan** for nearby ELDs and pick one
2. **Connect**: the service connects, authenticates and then pulls history in
   progressively wider windows until the device has no more recent data
3. **Read the timeline**: live samples and fetched history, merged and ordered

Device timestamps are UTC. Cancelling a sync keeps whatever was merged.
",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local eldsync server")
    ),
    tags(
        (name = "system", description = "Health checks"),
        (name = "connection", description = "ELD connection lifecycle"),
        (name = "devices", description = "Bluetooth scanning for ELDs"),
        (name = "sync", description = "Synchronized telemetry timeline")
    ),
    paths(
        super::health::health_check,
        super::connection::get_connection,
        super::connection::start_connection,
        super::connection::disconnect,
        super::devices::list_devices,
        super::devices::start_scan,
        super::devices::stop_scan,
        super::sync::get_timeline,
        super::sync::cancel_sync,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            ConnectRequest,
            ConnectionResponse,
            ConnectionSnapshot,
            ConnectionState,
            ConnectionSession,
            FailureReason,
            LinkStatus,
            DevicesResponse,
            DiscoveredDevice,
            TimelineResponse,
            TelemetryRecord,
            CancelSyncResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "eldsync API");
        assert!(spec.paths.paths.contains_key("/api/connection"));
        assert!(spec.paths.paths.contains_key("/api/timeline"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"eldsync API\""));
        assert!(json.contains("getSyncTimeline"));
    }
}
