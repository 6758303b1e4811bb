//! Sync progress notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use utoipa::ToSchema;

/// Capacity of the progress channel. Slow subscribers lose the oldest
/// updates.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// What happened to a stage or chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Work on the stage or chunk began.
    Started,
    /// An escalation stage found valid data.
    HasData,
    /// An escalation stage found nothing usable.
    NoData,
    /// A chunk finished.
    Completed,
    /// A chunk gave up after its retries.
    Failed,
    /// Work stopped because it was cancelled.
    Cancelled,
}

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    /// Escalation stage name (`5min`) or chunk label (`eld_events 2/3`).
    pub stage: String,
    /// Outcome so far.
    pub status: ProgressStatus,
    /// Records seen by the stage or chunk.
    pub record_count: usize,
}

/// Fan-out of progress updates.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: broadcast::Sender<SyncProgress>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    /// Create a reporter with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an update. Updates with nobody listening are dropped.
    pub fn report(&self, stage: impl Into<String>, status: ProgressStatus, record_count: usize) {
        let update = SyncProgress {
            stage: stage.into(),
            status,
            record_count,
        };
        tracing::trace!(stage = %update.stage, status = ?update.status, record_count, "sync progress");
        let _ = self.tx.send(update);
    }

    /// Receive future updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.tx.subscribe()
    }
}
