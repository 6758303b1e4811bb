//! Synchronized timeline endpoints.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use eldsync_core::TelemetryRecord;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// The merged, deduplicated telemetry timeline.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TimelineResponse {
    /// Records in chronological order.
    pub records: Vec<TelemetryRecord>,

    /// Number of records.
    #[schema(example = 42)]
    pub record_count: usize,

    /// Whether a history sync is still adding records.
    pub is_syncing: bool,

    /// When this snapshot was taken.
    #[schema(example = "2025-01-15T08:30:00Z")]
    pub generated_at_utc: String,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({ "cancelled": true }))]
pub struct CancelSyncResponse {
    /// Whether a sync was running and got cancelled.
    pub cancelled: bool,
}

/// Get the synchronized timeline.
#[utoipa::path(
    get,
    path = "/api/timeline",
    tag = "sync",
    operation_id = "getSyncTimeline",
    summary = "Get the synchronized telemetry timeline",
    description = "Returns live and fetched history records merged into one \
        duplicate-free timeline, oldest first.",
    responses(
        (status = 200, description = "Timeline snapshot", body = TimelineResponse)
    )
)]
pub async fn get_timeline(State(state): State<SharedState>) -> Json<TimelineResponse> {
    let orchestrator = state.orchestrator();
    let snapshot = orchestrator.timeline();
    Json(TimelineResponse {
        record_count: snapshot.len(),
        records: snapshot.as_ref().clone(),
        is_syncing: orchestrator.is_syncing(),
        generated_at_utc: Utc::now().to_rfc3339(),
    })
}

/// Cancel the running history sync.
#[utoipa::path(
    post,
    path = "/api/sync/cancel",
    tag = "sync",
    operation_id = "cancelSync",
    summary = "Cancel history sync",
    description = "Stops the running history sync at the next chunk boundary. \
        Records already merged stay in the timeline.",
    responses(
        (status = 200, description = "Cancel processed", body = CancelSyncResponse)
    )
)]
pub async fn cancel_sync(State(state): State<SharedState>) -> Json<CancelSyncResponse> {
    Json(CancelSyncResponse {
        cancelled: state.orchestrator().cancel_sync(),
    })
}
