//! HTTP API routes and handlers.
//!
//! - `connection` - connect, disconnect, connection state
//! - `devices` - Bluetooth scanning
//! - `sync` - merged timeline and sync cancellation
//! - `health` - service health
//! - `error` - API error types
//! - `openapi` - OpenAPI specification

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod connection;
pub mod devices;
pub mod error;
pub mod health;
pub mod openapi;
pub mod sync;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::{get_openapi_json, ApiDoc};

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                 - Health check
/// /swagger-ui             - Swagger UI
/// /api
/// ├── /connection         - GET state, POST connect, DELETE disconnect
/// ├── /devices            - Discovered devices
/// ├── /devices/scan       - POST start, DELETE stop
/// ├── /timeline           - Synchronized telemetry
/// ├── /sync/cancel        - Cancel history sync
/// └── /openapi.json       - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    let api = Router::new()
        .route(
            "/connection",
            get(connection::get_connection)
                .post(connection::start_connection)
                .delete(connection::disconnect),
        )
        .route("/devices", get(devices::list_devices))
        .route(
            "/devices/scan",
            post(devices::start_scan).delete(devices::stop_scan),
        )
        .route("/timeline", get(sync::get_timeline))
        .route("/sync/cancel", post(sync::cancel_sync))
        .route("/openapi.json", get(openapi::get_openapi_spec));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", api)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::{TimeDelta, Utc};
    use eldsync_core::link::mock::MockLink;
    use eldsync_core::{format_wire, Config, SharedLink, SyncOrchestrator, TelemetryRecord};
    use serde_json::{json, Value};

    use super::*;
    use crate::state::AppState;

    const ADDRESS: &str = "C4:A8:28:43:14:9A";

    fn test_server() -> (TestServer, Arc<MockLink>, SyncOrchestrator) {
        let link = Arc::new(MockLink::new());
        let shared: SharedLink = link.clone();
        let orchestrator = SyncOrchestrator::start(shared, Config::default());
        let server = TestServer::new(create_router(AppState::new(orchestrator.clone()))).unwrap();
        (server, link, orchestrator)
    }

    #[tokio::test]
    async fn test_health() {
        let (server, _link, _orchestrator) = test_server();

        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connection_state"], "idle");
        assert_eq!(body["is_syncing"], false);
    }

    #[tokio::test]
    async fn test_connection_starts_idle() {
        let (server, _link, _orchestrator) = test_server();

        let response = server.get("/api/connection").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["connection"]["state"], "idle");
        assert_eq!(body["link"]["isConnected"], false);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_address() {
        let (server, link, _orchestrator) = test_server();

        let response = server
            .post("/api/connection")
            .json(&json!({ "address": "not-a-mac" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "invalid_bluetooth_address");
        assert_eq!(link.query_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_disconnect() {
        let (server, _link, _orchestrator) = test_server();

        let response = server
            .post("/api/connection")
            .json(&json!({ "address": ADDRESS.to_lowercase() }))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["connection"]["state"], "ready");
        assert_eq!(body["connection"]["session"]["deviceAddress"], ADDRESS);

        let response = server.delete("/api/connection").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["connection"]["state"], "disconnected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_is_not_found() {
        let (server, _link, _orchestrator) = test_server();

        let response = server
            .post("/api/connection")
            .json(&json!({ "address": "00:11:22:33:44:55" }))
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "device_not_found");
    }

    #[tokio::test]
    async fn test_scan_lifecycle() {
        let (server, _link, _orchestrator) = test_server();

        let response = server.post("/api/devices/scan").await;
        response.assert_status(StatusCode::ACCEPTED);
        let body: Value = response.json();
        assert_eq!(body["is_scanning"], true);

        // A second start while scanning is absorbed.
        server
            .post("/api/devices/scan")
            .await
            .assert_status(StatusCode::ACCEPTED);

        let response = server.delete("/api/devices/scan").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["is_scanning"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeline_contains_fetched_history() {
        let (server, link, orchestrator) = test_server();
        link.set_history(vec![TelemetryRecord {
            device_id: Some("PT30-ELD-001".into()),
            event_time: Some(format_wire(Utc::now() - TimeDelta::minutes(2))),
            event_type: Some(1),
            event_id: Some(7),
            ..TelemetryRecord::default()
        }]);

        server
            .post("/api/connection")
            .json(&json!({ "address": ADDRESS }))
            .await
            .assert_status_ok();

        for _ in 0..10_000 {
            if !orchestrator.timeline().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        let response = server.get("/api/timeline").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["record_count"], 1);
        assert_eq!(body["records"][0]["eventId"], 7);
    }

    #[tokio::test]
    async fn test_cancel_without_sync() {
        let (server, _link, _orchestrator) = test_server();

        let response = server.post("/api/sync/cancel").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["cancelled"], false);
    }

    #[tokio::test]
    async fn test_openapi_document_is_served() {
        let (server, _link, _orchestrator) = test_server();

        let response = server.get("/api/openapi.json").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["info"]["title"], "eldsync API");
    }
}
