//! Record deduplication and chronological ordering.
//!
//! Live-streamed and historically-queried records overlap freely.
//! [`dedup_and_sort`] keeps the first occurrence of each
//! [`RecordKey`](crate::record::RecordKey) and orders the survivors by
//! resolved time, then receipt time. Fetch results go through it directly;
//! the timeline merge task maintains the same order incrementally.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::record::TelemetryRecord;

/// Result of a dedup pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// Unique records in chronological order.
    pub records: Vec<TelemetryRecord>,
    /// How many inputs were dropped as duplicates.
    pub duplicates_removed: usize,
}

/// Remove duplicate records and sort the rest chronologically.
///
/// Stable: records with equal `(resolved time, receivedAt)` keep their input
/// order. Records without any parseable time are placed at the moment of the
/// call, captured once.
#[must_use]
pub fn dedup_and_sort(records: Vec<TelemetryRecord>) -> DedupOutcome {
    dedup_and_sort_at(records, Utc::now())
}

/// [`dedup_and_sort`] with an explicit fallback instant for unresolvable
/// records.
#[must_use]
pub fn dedup_and_sort_at(records: Vec<TelemetryRecord>, fallback: DateTime<Utc>) -> DedupOutcome {
    let mut seen = HashSet::with_capacity(records.len());
    let mut duplicates_removed = 0;

    let mut keyed: Vec<(DateTime<Utc>, DateTime<Utc>, TelemetryRecord)> = records
        .into_iter()
        .filter(|record| {
            let fresh = seen.insert(record.key());
            if !fresh {
                duplicates_removed += 1;
            }
            fresh
        })
        .map(|record| {
            let resolved = record.resolve_with_confidence(fallback).instant;
            let received = record.received_at.unwrap_or(DateTime::UNIX_EPOCH);
            (resolved, received, record)
        })
        .collect();

    keyed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    if duplicates_removed > 0 {
        tracing::trace!(duplicates_removed, unique = keyed.len(), "deduplicated records");
    }

    DedupOutcome {
        records: keyed.into_iter().map(|(_, _, record)| record).collect(),
        duplicates_removed,
    }
}

/// Merge `incoming` into an already-merged sequence.
///
/// Existing records win over incoming duplicates.
#[must_use]
pub fn merge(existing: &[TelemetryRecord], incoming: Vec<TelemetryRecord>) -> DedupOutcome {
    let mut combined = Vec::with_capacity(existing.len() + incoming.len());
    combined.extend_from_slice(existing);
    combined.extend(incoming);
    dedup_and_sort(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use crate::timestamp::format_wire;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap()
    }

    fn record(minute: i64, event_id: i64) -> TelemetryRecord {
        TelemetryRecord {
            device_id: Some("PT30-ELD-001".into()),
            event_time: Some(format_wire(base() + Duration::minutes(minute))),
            event_type: Some(1),
            event_id: Some(event_id),
            ..TelemetryRecord::default()
        }
    }

    fn sample() -> Vec<TelemetryRecord> {
        let mut late_gps = record(0, 9);
        late_gps.event_time = None;
        late_gps.gps_time = Some("2025-01-15T08:45:00Z".into());

        vec![
            record(30, 3),
            record(10, 1),
            record(30, 3),
            late_gps,
            record(20, 2),
            record(10, 1),
        ]
    }

    #[test]
    fn test_removes_duplicates_and_counts_them() {
        let outcome = dedup_and_sort_at(sample(), base());
        assert_eq!(outcome.records.len(), 4);
        assert_eq!(outcome.duplicates_removed, 2);
    }

    #[test]
    fn test_output_is_chronological() {
        let outcome = dedup_and_sort_at(sample(), base());
        let ids: Vec<i64> = outcome
            .records
            .iter()
            .map(|r| r.event_id.unwrap())
            .collect();
        assert_eq!(ids, [1, 2, 3, 9]);

        for pair in outcome.records.windows(2) {
            let a = pair[0].resolve_with_confidence(base()).instant;
            let b = pair[1].resolve_with_confidence(base()).instant;
            assert!(a <= b);
        }
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let once = dedup_and_sort_at(sample(), base());
        let twice = dedup_and_sort_at(once.records.clone(), base());
        assert_eq!(once.records, twice.records);
        assert_eq!(twice.duplicates_removed, 0);
    }

    #[test]
    fn test_first_occurrence_wins_regardless_of_position() {
        let mut first = record(5, 1);
        first.payload.insert("origin".into(), json!("live"));
        let mut second = record(5, 1);
        second.payload.insert("origin".into(), json!("history"));

        let outcome = dedup_and_sort_at(vec![record(1, 0), first, record(9, 2), second], base());
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[1].payload["origin"], json!("live"));
    }

    #[test]
    fn test_received_at_breaks_ties() {
        let mut early = record(0, 1);
        early.received_at = Some(base() + Duration::seconds(5));
        let mut late = record(0, 2);
        late.received_at = Some(base() + Duration::seconds(1));
        let unknown = record(0, 3);

        let outcome = dedup_and_sort_at(vec![early, late, unknown], base());
        let ids: Vec<i64> = outcome
            .records
            .iter()
            .map(|r| r.event_id.unwrap())
            .collect();
        assert_eq!(ids, [3, 2, 1]);
    }

    #[test]
    fn test_equal_keys_are_stable() {
        let mut a = record(0, 1);
        a.device_id = Some("A".into());
        let mut b = record(0, 1);
        b.device_id = Some("B".into());

        let outcome = dedup_and_sort_at(vec![b.clone(), a.clone()], base());
        assert_eq!(outcome.records, vec![b, a]);
    }

    #[test]
    fn test_equivalent_times_in_different_formats_are_distinct() {
        let wire = record(0, 1);
        let mut iso = record(0, 1);
        iso.event_time = Some("2025-01-15T08:00:00Z".into());

        let outcome = dedup_and_sort_at(vec![wire, iso], base());
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.duplicates_removed, 0);
    }

    #[test]
    fn test_merge_prefers_existing() {
        let mut existing = record(0, 1);
        existing.payload.insert("source".into(), json!("existing"));
        let mut incoming = record(0, 1);
        incoming.payload.insert("source".into(), json!("incoming"));

        let merged = merge(&[existing], vec![incoming, record(1, 2)]);
        assert_eq!(merged.records.len(), 2);
        assert_eq!(merged.duplicates_removed, 1);
        assert_eq!(merged.records[0].payload["source"], json!("existing"));
    }

    #[test]
    fn test_empty_input() {
        let outcome = dedup_and_sort(Vec::new());
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.duplicates_removed, 0);
    }
}
