//! The merged telemetry timeline.
//!
//! Live telemetry and fetched history both end up here. Producers submit
//! batches to a merge queue; a single merge task drains it, coalescing
//! whatever is pending into one merge, and swaps the published snapshot.
//! Readers only ever see whole snapshots.
//!
//! The merge task keeps a private [`TimelineIndex`] of every key it has seen
//! and the sort key of every record, so each merge only sorts the incoming
//! batch and walks the existing records once. The result is the same as
//! [`dedup::merge`](crate::dedup::merge) of the current timeline with the
//! batch, without rehashing or re-sorting what is already merged.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::record::{RecordKey, TelemetryRecord};

/// Capacity of the merge queue.
pub const MERGE_QUEUE_CAPACITY: usize = 256;

/// A read-only timeline snapshot.
pub type TimelineSnapshot = Arc<Vec<TelemetryRecord>>;

/// `(resolved time, receivedAt or epoch)`, the timeline order.
type SortKey = (DateTime<Utc>, DateTime<Utc>);

enum MergeCommand {
    Merge(Vec<TelemetryRecord>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the timeline and its merge queue.
#[derive(Debug, Clone)]
pub struct SyncTimeline {
    queue: mpsc::Sender<MergeCommand>,
    snapshot: watch::Receiver<TimelineSnapshot>,
}

impl std::fmt::Debug for MergeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merge(batch) => f.debug_tuple("Merge").field(&batch.len()).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl SyncTimeline {
    /// Start the merge task with no retention limit. It runs until
    /// `shutdown` is cancelled or every handle is dropped.
    #[must_use]
    pub fn spawn(shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        Self::spawn_with_retention(shutdown, None)
    }

    /// Start the merge task. With `retention` set, every merge drops records
    /// whose resolved time is older than `now - retention`.
    #[must_use]
    pub fn spawn_with_retention(
        shutdown: CancellationToken,
        retention: Option<TimeDelta>,
    ) -> (Self, JoinHandle<()>) {
        let (queue, commands) = mpsc::channel(MERGE_QUEUE_CAPACITY);
        let (publisher, snapshot) = watch::channel(TimelineSnapshot::default());
        let task = tokio::spawn(run_merge_task(commands, publisher, retention, shutdown));
        (Self { queue, snapshot }, task)
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TimelineSnapshot {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Receive a notification each time the timeline is rebuilt.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TimelineSnapshot> {
        self.snapshot.clone()
    }

    /// Queue `records` for merging. Returns `false` if the merge task has
    /// stopped.
    pub async fn submit(&self, records: Vec<TelemetryRecord>) -> bool {
        if records.is_empty() {
            return true;
        }
        self.queue.send(MergeCommand::Merge(records)).await.is_ok()
    }

    /// Wait until every batch submitted before this call is visible in the
    /// snapshot. Returns `false` if the merge task has stopped.
    pub async fn flush(&self) -> bool {
        let (done, wait) = oneshot::channel();
        if self.queue.send(MergeCommand::Flush(done)).await.is_err() {
            return false;
        }
        wait.await.is_ok()
    }
}

/// Merge-task state: the ordered records plus the keys they carry.
#[derive(Debug, Default)]
struct TimelineIndex {
    keys: HashSet<RecordKey>,
    entries: Vec<(SortKey, TelemetryRecord)>,
}

impl TimelineIndex {
    /// Merge `incoming`, returning how many were dropped as duplicates.
    ///
    /// Unresolvable records are placed at `fallback`. Ties keep existing
    /// records first, then incoming records in submission order.
    fn insert(&mut self, incoming: Vec<TelemetryRecord>, fallback: DateTime<Utc>) -> usize {
        let mut duplicates = 0;
        let mut fresh: Vec<(SortKey, TelemetryRecord)> = incoming
            .into_iter()
            .filter(|record| {
                let new = self.keys.insert(record.key());
                if !new {
                    duplicates += 1;
                }
                new
            })
            .map(|record| {
                let resolved = record.resolve_with_confidence(fallback).instant;
                let received = record.received_at.unwrap_or(DateTime::UNIX_EPOCH);
                ((resolved, received), record)
            })
            .collect();
        if fresh.is_empty() {
            return duplicates;
        }
        fresh.sort_by(|a, b| a.0.cmp(&b.0));

        let existing = std::mem::take(&mut self.entries);
        let mut merged = Vec::with_capacity(existing.len() + fresh.len());
        let mut fresh = fresh.into_iter().peekable();
        for entry in existing {
            while let Some(next) = fresh.next_if(|next| next.0 < entry.0) {
                merged.push(next);
            }
            merged.push(entry);
        }
        merged.extend(fresh);
        self.entries = merged;
        duplicates
    }

    /// Drop records resolved before `cutoff` and forget their keys.
    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let stale = self.entries.partition_point(|(key, _)| key.0 < cutoff);
        for (_, record) in self.entries.drain(..stale) {
            self.keys.remove(&record.key());
        }
        stale
    }

    fn snapshot(&self) -> TimelineSnapshot {
        Arc::new(self.entries.iter().map(|(_, record)| record.clone()).collect())
    }
}

async fn run_merge_task(
    mut commands: mpsc::Receiver<MergeCommand>,
    publisher: watch::Sender<TimelineSnapshot>,
    retention: Option<TimeDelta>,
    shutdown: CancellationToken,
) {
    let mut index = TimelineIndex::default();
    loop {
        let first = tokio::select! {
            () = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let mut pending = Vec::new();
        let mut waiters = Vec::new();
        let mut batches = 0usize;
        let mut take = |command: MergeCommand| match command {
            MergeCommand::Merge(records) => {
                batches += 1;
                pending.extend(records);
            }
            MergeCommand::Flush(done) => waiters.push(done),
        };

        take(first);
        while let Ok(command) = commands.try_recv() {
            take(command);
        }

        if !pending.is_empty() {
            let now = Utc::now();
            let incoming = pending.len();
            let duplicates_removed = index.insert(pending, now);
            let pruned = retention.map_or(0, |retention| index.prune_before(now - retention));
            debug!(
                batches,
                incoming,
                duplicates_removed,
                pruned,
                total = index.entries.len(),
                "timeline rebuilt"
            );
            publisher.send_replace(index.snapshot());
        }

        for done in waiters {
            let _ = done.send(());
        }
    }
    trace!("timeline merge task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};
    use serde_json::json;

    use crate::dedup;
    use crate::timestamp::format_wire;

    fn record(minute: i64, event_id: i64) -> TelemetryRecord {
        let base = Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap();
        TelemetryRecord {
            device_id: Some("PT30-ELD-001".into()),
            event_time: Some(format_wire(base + TimeDelta::minutes(minute))),
            event_type: Some(1),
            event_id: Some(event_id),
            ..TelemetryRecord::default()
        }
    }

    #[tokio::test]
    async fn test_batches_merge_into_one_ordered_timeline() {
        let (timeline, _task) = SyncTimeline::spawn(CancellationToken::new());

        assert!(timeline.submit(vec![record(20, 2), record(0, 0)]).await);
        assert!(timeline.submit(vec![record(10, 1), record(20, 2)]).await);
        assert!(timeline.flush().await);

        let ids: Vec<i64> = timeline
            .snapshot()
            .iter()
            .map(|r| r.event_id.unwrap())
            .collect();
        assert_eq!(ids, [0, 1, 2]);
    }

    #[tokio::test]
    async fn test_existing_records_win() {
        let (timeline, _task) = SyncTimeline::spawn(CancellationToken::new());

        let mut live = record(5, 1);
        live.payload.insert("origin".into(), json!("live"));
        let mut history = record(5, 1);
        history.payload.insert("origin".into(), json!("history"));

        timeline.submit(vec![live]).await;
        timeline.flush().await;
        timeline.submit(vec![history]).await;
        timeline.flush().await;

        let snapshot = timeline.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].payload["origin"], json!("live"));
    }

    #[tokio::test]
    async fn test_old_snapshots_are_unaffected_by_rebuilds() {
        let (timeline, _task) = SyncTimeline::spawn(CancellationToken::new());
        timeline.submit(vec![record(0, 0)]).await;
        timeline.flush().await;

        let before = timeline.snapshot();
        timeline.submit(vec![record(1, 1)]).await;
        timeline.flush().await;

        assert_eq!(before.len(), 1);
        assert_eq!(timeline.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_rebuilds() {
        let (timeline, _task) = SyncTimeline::spawn(CancellationToken::new());
        let mut updates = timeline.subscribe();

        timeline.submit(vec![record(0, 0)]).await;
        updates.changed().await.unwrap();
        assert_eq!(updates.borrow_and_update().len(), 1);
    }

    #[test]
    fn test_index_matches_pure_merge() {
        let fallback = Utc::now();
        let mut untimed = record(0, 9);
        untimed.event_time = None;
        let mut late_receipt = record(10, 4);
        late_receipt.received_at = Some(fallback);

        let existing = vec![record(30, 3), record(10, 1), record(0, 0)];
        let incoming = vec![
            record(20, 2),
            late_receipt,
            record(10, 1),
            untimed,
            record(40, 5),
            record(20, 2),
        ];

        let mut index = TimelineIndex::default();
        assert_eq!(index.insert(existing.clone(), fallback), 0);
        assert_eq!(index.insert(incoming.clone(), fallback), 2);

        let current = dedup::dedup_and_sort(existing).records;
        let expected = dedup::merge(&current, incoming);
        assert_eq!(expected.duplicates_removed, 2);
        assert_eq!(*index.snapshot(), expected.records);
        assert_eq!(index.keys.len(), expected.records.len());
    }

    #[test]
    fn test_index_keeps_existing_record_on_tie() {
        let fallback = Utc::now();
        let mut first = record(5, 1);
        first.payload.insert("origin".into(), json!("first"));
        let mut same_instant = record(5, 2);
        same_instant.payload.insert("origin".into(), json!("second"));

        let mut index = TimelineIndex::default();
        index.insert(vec![first], fallback);
        index.insert(vec![same_instant], fallback);

        let snapshot = index.snapshot();
        assert_eq!(snapshot[0].payload["origin"], json!("first"));
        assert_eq!(snapshot[1].payload["origin"], json!("second"));
    }

    #[test]
    fn test_prune_forgets_old_keys() {
        let fallback = Utc::now();
        let mut index = TimelineIndex::default();
        index.insert((0..5).map(|minute| record(minute * 10, minute)).collect(), fallback);

        let cutoff = Utc.with_ymd_and_hms(2025, 1, 15, 8, 25, 0).unwrap();
        assert_eq!(index.prune_before(cutoff), 3);
        let ids: Vec<i64> = index.snapshot().iter().map(|r| r.event_id.unwrap()).collect();
        assert_eq!(ids, [3, 4]);

        // A pruned record is no longer a duplicate.
        assert_eq!(index.insert(vec![record(0, 0)], fallback), 0);
        assert_eq!(index.keys.len(), 3);
    }

    #[tokio::test]
    async fn test_retention_drops_stale_records() {
        let (timeline, _task) =
            SyncTimeline::spawn_with_retention(CancellationToken::new(), Some(TimeDelta::hours(1)));

        let mut recent = record(0, 1);
        recent.event_time = Some(format_wire(Utc::now() - TimeDelta::minutes(5)));
        timeline.submit(vec![record(0, 0), recent]).await;
        timeline.flush().await;

        let snapshot = timeline.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].event_id, Some(1));
    }

    #[tokio::test]
    async fn test_without_retention_old_records_stay() {
        let (timeline, _task) = SyncTimeline::spawn(CancellationToken::new());
        timeline.submit(vec![record(0, 0)]).await;
        timeline.flush().await;
        assert_eq!(timeline.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_merge_task() {
        let shutdown = CancellationToken::new();
        let (timeline, task) = SyncTimeline::spawn(shutdown.clone());

        shutdown.cancel();
        task.await.unwrap();
        assert!(!timeline.submit(vec![record(0, 0)]).await);
        assert!(!timeline.flush().await);
    }
}
