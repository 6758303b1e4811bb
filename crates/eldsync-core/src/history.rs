//! Chunked history retrieval.
//!
//! A history range is split into bounded chunks which are queried one after
//! another over the shared link. Each chunk gets a bounded number of attempts
//! with exponential backoff; a chunk that keeps failing is marked failed and
//! the rest of the range still runs. Records come back asynchronously on the
//! link's event stream and are collected during a short settle window after
//! each query.
//!
//! Cancellation is cooperative. It is checked between chunks, between
//! attempts and during backoff, but never interrupts a query already sent to
//! the device. Chunks that completed stay completed.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::dedup;
use crate::error::{Result, SyncError};
use crate::link::{HistoryKind, LinkEvent, SharedLink, TelemetryOrigin};
use crate::progress::{ProgressReporter, ProgressStatus};
use crate::record::TelemetryRecord;
use crate::timestamp;

/// Default chunk width.
pub const DEFAULT_CHUNK_MINUTES: u32 = 60;
/// Default attempts per chunk.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    /// Not yet started.
    Pending,
    /// An attempt is underway.
    Fetching,
    /// The query was acknowledged and its records collected.
    Completed,
    /// Every attempt failed.
    Failed,
    /// The fetch was cancelled before this chunk completed.
    Cancelled,
}

/// One bounded sub-range of a history fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryChunk {
    /// Position within the fetch.
    pub index: usize,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// `start` in device wire format.
    pub formatted_start: String,
    /// `end` in device wire format.
    pub formatted_end: String,
    /// Current status.
    pub status: ChunkStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// History records collected for this chunk.
    pub records_received: usize,
    /// Why the chunk failed.
    pub error: Option<String>,
}

/// Split `[start, end)` into consecutive chunks of `chunk` width. The last
/// chunk is truncated at `end`.
///
/// # Errors
///
/// Returns [`SyncError::InvalidRange`] if `start >= end` and
/// [`SyncError::InvalidChunkSize`] if `chunk` is not positive.
pub fn plan_chunks(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk: TimeDelta,
) -> Result<Vec<HistoryChunk>> {
    if start >= end {
        return Err(SyncError::InvalidRange { start, end });
    }
    if chunk <= TimeDelta::zero() {
        return Err(SyncError::InvalidChunkSize);
    }

    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let chunk_end = (cursor + chunk).min(end);
        chunks.push(HistoryChunk {
            index: chunks.len(),
            start: cursor,
            end: chunk_end,
            formatted_start: timestamp::format_wire(cursor),
            formatted_end: timestamp::format_wire(chunk_end),
            status: ChunkStatus::Pending,
            attempts: 0,
            records_received: 0,
            error: None,
        });
        cursor = chunk_end;
    }
    Ok(chunks)
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per chunk.
    pub max_retries: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(4000),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (zero-based):
    /// `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Fetcher tuning derived from [`HistoryConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherSettings {
    /// Backoff bounds; `max_retries` is the default for new requests.
    pub retry: RetryPolicy,
    /// Default chunk width for new requests.
    pub chunk_minutes: u32,
    /// How long to keep collecting after a query is acknowledged.
    pub settle: Duration,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self::from(&HistoryConfig::default())
    }
}

impl From<&HistoryConfig> for FetcherSettings {
    fn from(config: &HistoryConfig) -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.base_backoff_ms),
                max_delay: Duration::from_millis(config.max_backoff_ms),
            },
            chunk_minutes: config.chunk_size_minutes,
            settle: Duration::from_millis(config.settle_ms),
        }
    }
}

/// A history fetch to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Handle for [`HistoryFetcher::cancel_fetch`].
    pub id: Uuid,
    /// Which log to query.
    pub kind: HistoryKind,
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
    /// Chunk width.
    pub chunk_minutes: u32,
    /// Attempts per chunk.
    pub max_retries: u32,
}

impl FetchRequest {
    /// A request with default chunking and retries.
    #[must_use]
    pub fn new(kind: HistoryKind, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            start,
            end,
            chunk_minutes: DEFAULT_CHUNK_MINUTES,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Use `minutes`-wide chunks.
    #[must_use]
    pub const fn with_chunk_minutes(mut self, minutes: u32) -> Self {
        self.chunk_minutes = minutes;
        self
    }

    /// Allow `retries` attempts per chunk. Zero still makes one attempt;
    /// configured values are rejected at load time instead.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Result of a history fetch.
///
/// `records` are the history-origin telemetry records observed on the link's
/// event stream while this fetch's chunks were being collected, deduplicated
/// and in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchReport {
    /// Collected records.
    pub records: Vec<TelemetryRecord>,
    /// Duplicates dropped while merging chunk results.
    pub duplicates_removed: usize,
    /// Final state of every chunk.
    pub chunks: Vec<HistoryChunk>,
    /// Number of chunks.
    pub total_chunks: usize,
    /// Chunks that completed.
    pub completed_chunks: usize,
    /// Chunks that exhausted their retries.
    pub failed_chunks: usize,
    /// Whether the fetch was cancelled before every chunk ran.
    pub cancelled: bool,
}

enum ChunkOutcome {
    Completed(Vec<TelemetryRecord>),
    Failed,
    Cancelled,
}

/// Runs chunked history fetches over a shared link.
pub struct HistoryFetcher {
    link: SharedLink,
    gate: tokio::sync::Mutex<()>,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    settings: FetcherSettings,
    progress: Option<ProgressReporter>,
}

impl std::fmt::Debug for HistoryFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryFetcher")
            .field("settings", &self.settings)
            .field("active", &self.active_fetches())
            .finish_non_exhaustive()
    }
}

struct ActiveFetch<'a> {
    fetcher: &'a HistoryFetcher,
    id: Uuid,
}

impl Drop for ActiveFetch<'_> {
    fn drop(&mut self) {
        self.fetcher.active().remove(&self.id);
    }
}

impl HistoryFetcher {
    /// Create a fetcher over `link`.
    #[must_use]
    pub fn new(link: SharedLink, settings: FetcherSettings) -> Self {
        Self {
            link,
            gate: tokio::sync::Mutex::new(()),
            active: Mutex::new(HashMap::new()),
            settings,
            progress: None,
        }
    }

    /// Publish per-chunk progress to `reporter`.
    #[must_use]
    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    /// A request for `[start, end)` using the configured defaults.
    #[must_use]
    pub fn request(
        &self,
        kind: HistoryKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> FetchRequest {
        FetchRequest::new(kind, start, end)
            .with_chunk_minutes(self.settings.chunk_minutes)
            .with_max_retries(self.settings.retry.max_retries)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of fetches currently running.
    #[must_use]
    pub fn active_fetches(&self) -> usize {
        self.active().len()
    }

    /// Cancel the fetch with `id`. Returns whether it was running.
    pub fn cancel_fetch(&self, id: Uuid) -> bool {
        self.active().get(&id).map(CancellationToken::cancel).is_some()
    }

    /// Cancel every running fetch. Returns how many were cancelled.
    pub fn cancel_all_fetches(&self) -> usize {
        let active = self.active();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    /// Run `request` to completion or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidRange`] or [`SyncError::InvalidChunkSize`]
    /// for malformed requests. Chunk failures never fail the fetch; they are
    /// reported per chunk.
    pub async fn fetch_history(&self, request: FetchRequest) -> Result<FetchReport> {
        self.fetch_history_with(request, &CancellationToken::new())
            .await
    }

    /// [`fetch_history`](Self::fetch_history), also stopping when `parent` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// See [`fetch_history`](Self::fetch_history).
    pub async fn fetch_history_with(
        &self,
        request: FetchRequest,
        parent: &CancellationToken,
    ) -> Result<FetchReport> {
        let mut chunks = plan_chunks(
            request.start,
            request.end,
            TimeDelta::minutes(i64::from(request.chunk_minutes)),
        )?;

        let token = parent.child_token();
        self.active().insert(request.id, token.clone());
        let _registration = ActiveFetch {
            fetcher: self,
            id: request.id,
        };

        info!(
            fetch_id = %request.id,
            kind = request.kind.as_str(),
            start = %request.start,
            end = %request.end,
            chunks = chunks.len(),
            "starting history fetch"
        );

        // Subscribe before the first query so no reply can slip past.
        let mut events = self.link.subscribe();
        let total = chunks.len();
        let mut collected = Vec::new();
        let mut cancelled = false;

        for (index, chunk) in chunks.iter_mut().enumerate() {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            let label = format!("{} {}/{}", request.kind.as_str(), index + 1, total);
            self.report(&label, ProgressStatus::Started, 0);

            match self.fetch_chunk(chunk, &request, &token, &mut events).await {
                ChunkOutcome::Completed(records) => {
                    self.report(&label, ProgressStatus::Completed, records.len());
                    collected.extend(records);
                }
                ChunkOutcome::Failed => {
                    self.report(&label, ProgressStatus::Failed, 0);
                }
                ChunkOutcome::Cancelled => {
                    self.report(&label, ProgressStatus::Cancelled, 0);
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            for chunk in &mut chunks {
                if matches!(chunk.status, ChunkStatus::Pending | ChunkStatus::Fetching) {
                    chunk.status = ChunkStatus::Cancelled;
                }
            }
        }

        let outcome = dedup::dedup_and_sort(collected);
        let completed_chunks = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .count();
        let failed_chunks = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .count();

        info!(
            fetch_id = %request.id,
            records = outcome.records.len(),
            duplicates_removed = outcome.duplicates_removed,
            completed_chunks,
            failed_chunks,
            cancelled,
            "history fetch finished"
        );

        Ok(FetchReport {
            records: outcome.records,
            duplicates_removed: outcome.duplicates_removed,
            total_chunks: chunks.len(),
            completed_chunks,
            failed_chunks,
            chunks,
            cancelled,
        })
    }

    fn report(&self, label: &str, status: ProgressStatus, record_count: usize) {
        if let Some(progress) = &self.progress {
            progress.report(label, status, record_count);
        }
    }

    async fn fetch_chunk(
        &self,
        chunk: &mut HistoryChunk,
        request: &FetchRequest,
        token: &CancellationToken,
        events: &mut broadcast::Receiver<LinkEvent>,
    ) -> ChunkOutcome {
        let max_attempts = request.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if token.is_cancelled() {
                return ChunkOutcome::Cancelled;
            }
            chunk.attempts += 1;
            chunk.status = ChunkStatus::Fetching;

            match self.try_chunk(chunk, request.kind, events).await {
                Ok(records) => {
                    chunk.status = ChunkStatus::Completed;
                    chunk.records_received = records.len();
                    chunk.error = None;
                    debug!(
                        chunk = chunk.index,
                        attempts = chunk.attempts,
                        records = records.len(),
                        "chunk completed"
                    );
                    return ChunkOutcome::Completed(records);
                }
                Err(reason) => {
                    last_error = reason;
                }
            }

            if attempt + 1 < max_attempts {
                let delay = self.settings.retry.backoff_delay(attempt);
                warn!(
                    chunk = chunk.index,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %last_error,
                    "chunk attempt failed, backing off"
                );
                tokio::select! {
                    () = token.cancelled() => return ChunkOutcome::Cancelled,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        let error = SyncError::QueryFailed {
            chunk: chunk.index,
            reason: last_error,
        };
        warn!(chunk = chunk.index, attempts = chunk.attempts, error = %error, "chunk failed");
        chunk.status = ChunkStatus::Failed;
        chunk.error = Some(error.to_string());
        ChunkOutcome::Failed
    }

    /// One attempt: check the link, query under the command gate, re-check,
    /// then collect the streamed replies.
    async fn try_chunk(
        &self,
        chunk: &HistoryChunk,
        kind: HistoryKind,
        events: &mut broadcast::Receiver<LinkEvent>,
    ) -> std::result::Result<Vec<TelemetryRecord>, String> {
        let status = self
            .link
            .connection_status()
            .await
            .map_err(|e| format!("connectivity check failed: {e}"))?;
        if !status.is_connected {
            return Err(format!(
                "ELD {} is not connected (bluetooth {})",
                status.current_device.as_deref().unwrap_or("device"),
                if status.is_bluetooth_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            ));
        }

        let _gate = self.gate.lock().await;
        self.link
            .query_history(kind, &chunk.formatted_start, &chunk.formatted_end)
            .await
            .map_err(|e| e.to_string())?;

        let after = self
            .link
            .connection_status()
            .await
            .map_err(|e| format!("connectivity re-check failed: {e}"))?;
        if !after.is_connected {
            return Err("link dropped while the query was in flight".to_string());
        }

        Ok(self.collect_replies(events).await)
    }

    async fn collect_replies(
        &self,
        events: &mut broadcast::Receiver<LinkEvent>,
    ) -> Vec<TelemetryRecord> {
        let deadline = tokio::time::Instant::now() + self.settings.settle;
        let mut records = Vec::new();

        loop {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) | Ok(Err(RecvError::Closed)) => break,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "history fetch fell behind the event stream");
                    continue;
                }
                Ok(Ok(event)) => event,
            };
            let LinkEvent::Telemetry(telemetry) = event else {
                continue;
            };
            if telemetry.origin != TelemetryOrigin::History {
                continue;
            }
            match telemetry.decode(None, Utc::now()) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "dropping undecodable history record"),
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;

    use crate::link::mock::MockLink;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap()
    }

    fn record_at(minute: i64, event_id: i64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: Some("PT30-ELD-001".into()),
            event_time: Some(timestamp::format_wire(base() + TimeDelta::minutes(minute))),
            event_type: Some(1),
            event_id: Some(event_id),
            ..TelemetryRecord::default()
        }
    }

    fn fetcher(link: &Arc<MockLink>) -> HistoryFetcher {
        let shared: SharedLink = link.clone();
        HistoryFetcher::new(shared, FetcherSettings::default())
    }

    fn connected_link() -> Arc<MockLink> {
        let link = Arc::new(MockLink::new());
        link.set_connected(true);
        link
    }

    #[test]
    fn test_chunks_tile_the_range() {
        let chunks = plan_chunks(
            base(),
            base() + TimeDelta::minutes(150),
            TimeDelta::minutes(60),
        )
        .unwrap();

        let widths: Vec<i64> = chunks
            .iter()
            .map(|c| (c.end - c.start).num_minutes())
            .collect();
        assert_eq!(widths, [60, 60, 30]);
        assert_eq!(chunks[0].start, base());
        assert_eq!(chunks[2].end, base() + TimeDelta::minutes(150));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(chunks[0].formatted_start, "250115080000");
        assert_eq!(chunks[0].formatted_end, "250115090000");
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }

    #[test]
    fn test_invalid_requests() {
        assert!(matches!(
            plan_chunks(base(), base(), TimeDelta::minutes(60)),
            Err(SyncError::InvalidRange { .. })
        ));
        assert!(matches!(
            plan_chunks(base(), base() + TimeDelta::hours(1), TimeDelta::zero()),
            Err(SyncError::InvalidChunkSize)
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<u128> = (0..5)
            .map(|attempt| policy.backoff_delay(attempt).as_millis())
            .collect();
        assert_eq!(delays, [1000, 2000, 4000, 4000, 4000]);
        assert_eq!(policy.backoff_delay(64), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_collects_records_for_the_range() {
        let link = connected_link();
        link.set_history(vec![
            record_at(10, 1),
            record_at(70, 2),
            record_at(130, 3),
            record_at(200, 4),
        ]);

        let request = FetchRequest::new(
            HistoryKind::EldEvents,
            base(),
            base() + TimeDelta::minutes(150),
        );
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(report.total_chunks, 3);
        assert_eq!(report.completed_chunks, 3);
        assert!(!report.cancelled);
        let ids: Vec<i64> = report.records.iter().map(|r| r.event_id.unwrap()).collect();
        assert_eq!(ids, [1, 2, 3]);
        assert_eq!(report.chunks[1].records_received, 1);
        assert_eq!(link.queries().len(), 3);
        assert_eq!(link.queries()[2].end, "250115103000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_deduplicates_repeated_replies() {
        let link = connected_link();
        link.set_history(vec![record_at(5, 1), record_at(5, 1), record_at(6, 2)]);

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1));
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.duplicates_removed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_chunk_is_attempted_max_retries_times() {
        let link = connected_link();
        link.fail_all_queries();

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1))
            .with_max_retries(3);
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(link.query_attempts(), 3);
        assert_eq!(report.failed_chunks, 1);
        let chunk = &report.chunks[0];
        assert_eq!(chunk.status, ChunkStatus::Failed);
        assert_eq!(chunk.attempts, 3);
        assert!(chunk.error.as_deref().unwrap().contains("chunk 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_still_attempts_each_chunk_once() {
        let link = connected_link();
        link.fail_all_queries();

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1))
            .with_max_retries(0);
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(link.query_attempts(), 1);
        assert_eq!(report.chunks[0].attempts, 1);
        assert_eq!(report.chunks[0].status, ChunkStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_does_not_abort_the_range() {
        let link = connected_link();
        link.fail_next_queries(3);
        link.set_history(vec![record_at(90, 7)]);

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(2));
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(report.chunks[0].status, ChunkStatus::Failed);
        assert_eq!(report.chunks[1].status, ChunkStatus::Completed);
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_with_backoff() {
        let link = connected_link();
        link.fail_next_queries(2);

        let started = tokio::time::Instant::now();
        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1));
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(report.completed_chunks, 1);
        assert_eq!(report.chunks[0].attempts, 3);
        // 1s + 2s of backoff plus one settle window.
        assert!(started.elapsed() >= Duration::from_millis(3000 + 1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_during_query_is_retried() {
        let link = connected_link();
        link.drop_after_next_queries(1);
        link.set_history(vec![record_at(1, 1)]);

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1));
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(report.chunks[0].status, ChunkStatus::Completed);
        assert_eq!(report.chunks[0].attempts, 2);
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_link_names_device_and_radio_state() {
        let link = Arc::new(MockLink::new());
        link.set_bluetooth_enabled(false);

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1));
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(link.query_attempts(), 0);
        let error = report.chunks[0].error.clone().unwrap();
        assert!(error.contains("not connected"));
        assert!(error.contains("bluetooth disabled"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_checks_are_transient() {
        let link = connected_link();
        link.fail_next_status_checks(1);

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1));
        let report = fetcher(&link).fetch_history(request).await.unwrap();

        assert_eq!(report.chunks[0].status, ChunkStatus::Completed);
        assert_eq!(report.chunks[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_keeps_completed_chunks() {
        let link = connected_link();
        let fetcher = Arc::new(fetcher(&link));

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(3));
        let id = request.id;
        let task = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch_history(request).await }
        });

        while link.queries().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(fetcher.cancel_fetch(id));

        let report = task.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert_eq!(report.chunks[0].status, ChunkStatus::Completed);
        assert_eq!(report.chunks[1].status, ChunkStatus::Cancelled);
        assert_eq!(report.chunks[2].status, ChunkStatus::Cancelled);
        assert_eq!(link.queries().len(), 1);
        assert_eq!(fetcher.active_fetches(), 0);
        assert!(!fetcher.cancel_fetch(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let link = connected_link();
        link.fail_all_queries();
        let fetcher = Arc::new(fetcher(&link));

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(2));
        let task = tokio::spawn({
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.fetch_history(request).await }
        });

        while link.query_attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(fetcher.cancel_all_fetches(), 1);

        let report = task.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert_eq!(link.query_attempts(), 1);
        assert!(report
            .chunks
            .iter()
            .all(|c| c.status == ChunkStatus::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_token_cancels_fetch() {
        let link = connected_link();
        let parent = CancellationToken::new();
        parent.cancel();

        let request = FetchRequest::new(HistoryKind::EldEvents, base(), base() + TimeDelta::hours(1));
        let report = fetcher(&link)
            .fetch_history_with(request, &parent)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.completed_chunks, 0);
        assert!(link.queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_reported_per_chunk() {
        let link = connected_link();
        let reporter = ProgressReporter::new();
        let mut updates = reporter.subscribe();
        let shared: SharedLink = link.clone();
        let fetcher = HistoryFetcher::new(shared, FetcherSettings::default()).with_progress(reporter);

        let request = FetchRequest::new(HistoryKind::EngineData, base(), base() + TimeDelta::hours(1));
        fetcher.fetch_history(request).await.unwrap();

        assert_eq!(updates.recv().await.unwrap().status, ProgressStatus::Started);
        let done = updates.recv().await.unwrap();
        assert_eq!(done.status, ProgressStatus::Completed);
        assert_eq!(done.stage, "engine_data 1/1");
    }

    #[test]
    fn test_settings_from_config() {
        let settings = FetcherSettings::from(&HistoryConfig {
            chunk_size_minutes: 30,
            max_retries: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 8000,
            settle_ms: 250,
        });
        assert_eq!(settings.retry.max_retries, 5);
        assert_eq!(settings.retry.backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(settings.settle, Duration::from_millis(250));
        assert_eq!(settings.chunk_minutes, 30);
    }
}
