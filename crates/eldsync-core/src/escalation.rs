//! Data-driven escalation of the history window.
//!
//! After a connection becomes ready we do not know how much history the
//! device holds. Instead of asking for a full day up front, the controller
//! probes a narrow window first and only widens it while the previous probe
//! produced recent, properly timestamped records:
//!
//! ```text
//! 5min (chunk 5) -> 20min (chunk 10) -> 4h (chunk 60) -> 24h (chunk 60)
//! ```
//!
//! A probe that fails or finds nothing usable ends the escalation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::config::{EscalationConfig, StageConfig};
use crate::dedup;
use crate::history::HistoryFetcher;
use crate::link::HistoryKind;
use crate::progress::{ProgressReporter, ProgressStatus};
use crate::record::TelemetryRecord;

/// Whether `records` contain at least one record with a real timestamp no
/// older than `max_age` at `now`.
///
/// Records whose time could not be resolved (and fell back to the wall
/// clock) never count.
#[must_use]
pub fn has_valid_data(records: &[TelemetryRecord], now: DateTime<Utc>, max_age: TimeDelta) -> bool {
    let cutoff = now - max_age;
    records.iter().any(|record| {
        let resolved = record.resolve_with_confidence(now);
        !resolved.is_fallback() && resolved.instant >= cutoff
    })
}

/// What one probe found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    /// Stage label.
    pub name: String,
    /// Window width in minutes.
    pub window_minutes: u32,
    /// Whether the probe produced valid data.
    pub has_data: bool,
    /// Records returned by the probe.
    pub record_count: usize,
    /// Chunks that exhausted their retries.
    pub failed_chunks: usize,
    /// Why the probe could not run.
    pub error: Option<String>,
}

/// Result of one escalation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EscalationOutcome {
    /// Every record from every probe, deduplicated and ordered.
    pub records: Vec<TelemetryRecord>,
    /// Duplicates dropped in the final merge.
    pub duplicates_removed: usize,
    /// Probes that ran, in order.
    pub stages: Vec<StageReport>,
    /// Another run was already in progress; nothing was fetched.
    pub already_running: bool,
    /// The run stopped because it was cancelled.
    pub cancelled: bool,
}

impl EscalationOutcome {
    /// Outcome of a call rejected because a run is in progress.
    #[must_use]
    pub fn already_running() -> Self {
        Self {
            already_running: true,
            ..Self::default()
        }
    }
}

/// Clears the running flag however the run ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs the escalating probe sequence.
#[derive(Debug)]
pub struct EscalationController {
    fetcher: Arc<HistoryFetcher>,
    stages: Vec<StageConfig>,
    max_age: TimeDelta,
    progress: ProgressReporter,
    running: AtomicBool,
}

impl EscalationController {
    /// Create a controller using `config`'s stages.
    #[must_use]
    pub fn new(
        fetcher: Arc<HistoryFetcher>,
        config: &EscalationConfig,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            fetcher,
            stages: config.stages.clone(),
            max_age: TimeDelta::days(i64::from(config.valid_data_max_age_days)),
            progress,
            running: AtomicBool::new(false),
        }
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Probe progressively wider windows of `kind` history ending now.
    ///
    /// Never fails: probe failures are logged and treated as "no data". A
    /// call made while another run is in progress returns immediately with
    /// [`EscalationOutcome::already_running`] set.
    pub async fn smart_fetch(&self, kind: HistoryKind, token: &CancellationToken) -> EscalationOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("escalation already running");
            return EscalationOutcome::already_running();
        }
        let _guard = RunningGuard(&self.running);

        let mut collected = Vec::new();
        let mut stages = Vec::with_capacity(self.stages.len());
        let mut cancelled = false;

        for stage in &self.stages {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            self.progress
                .report(stage.name.as_str(), ProgressStatus::Started, 0);

            let end = Utc::now();
            let start = end - TimeDelta::minutes(i64::from(stage.window_minutes));
            let request = self
                .fetcher
                .request(kind, start, end)
                .with_chunk_minutes(stage.chunk_minutes);

            let report = match self.fetcher.fetch_history_with(request, token).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(stage = %stage.name, error = %err, "escalation stage failed");
                    self.progress
                        .report(stage.name.as_str(), ProgressStatus::NoData, 0);
                    stages.push(StageReport {
                        name: stage.name.clone(),
                        window_minutes: stage.window_minutes,
                        has_data: false,
                        record_count: 0,
                        failed_chunks: 0,
                        error: Some(err.to_string()),
                    });
                    break;
                }
            };

            let has_data = has_valid_data(&report.records, Utc::now(), self.max_age);
            let record_count = report.records.len();
            if report.failed_chunks > 0 {
                warn!(
                    stage = %stage.name,
                    failed_chunks = report.failed_chunks,
                    "escalation stage had failed chunks"
                );
            }
            info!(stage = %stage.name, has_data, record_count, "escalation stage finished");

            let status = if report.cancelled {
                ProgressStatus::Cancelled
            } else if has_data {
                ProgressStatus::HasData
            } else {
                ProgressStatus::NoData
            };
            self.progress
                .report(stage.name.as_str(), status, record_count);
            stages.push(StageReport {
                name: stage.name.clone(),
                window_minutes: stage.window_minutes,
                has_data,
                record_count,
                failed_chunks: report.failed_chunks,
                error: None,
            });
            collected.extend(report.records);

            if report.cancelled {
                cancelled = true;
                break;
            }
            if !has_data {
                info!(stage = %stage.name, "no recent data, not widening the window");
                break;
            }
        }

        let merged = dedup::dedup_and_sort(collected);
        EscalationOutcome {
            records: merged.records,
            duplicates_removed: merged.duplicates_removed,
            stages,
            already_running: false,
            cancelled,
        }
    }
}
