//! Pure per-flush stages: effectiveness filter and deduplication.
//!
//! Order matters: stale records are removed first, then the first surviving
//! record per device wins. Swapping the two changes which record wins when
//! duplicates straddle the TTL boundary.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::core::BufferedRecord;

/// Whether a record is still young enough to reconcile.
pub fn is_effective(record: &BufferedRecord, now: DateTime<Utc>, ttl: Duration) -> bool {
    let age = now.signed_duration_since(record.observed_at());
    match age.to_std() {
        Ok(age) => age < ttl,
        // Observed in the future (clock skew between producers): keep it.
        Err(_) => true,
    }
}

/// Split a batch into effective records and the number of stale ones.
///
/// Stale records are not retried; the caller still commits them.
pub fn filter_effective(
    records: &[BufferedRecord],
    now: DateTime<Utc>,
    ttl: Duration,
) -> (Vec<&BufferedRecord>, usize) {
    let mut effective = Vec::with_capacity(records.len());
    let mut stale = 0;
    for record in records {
        if is_effective(record, now, ttl) {
            effective.push(record);
        } else {
            stale += 1;
            debug!(
                seq = record.seq,
                device_id = %record.device_id(),
                observed_at = %record.observed_at(),
                "dropping stale state event"
            );
        }
    }
    (effective, stale)
}

/// Keep the first occurrence of each device id, preserving arrival order.
pub fn dedup_first_wins<'a>(records: &[&'a BufferedRecord]) -> Vec<&'a BufferedRecord> {
    let mut seen: HashSet<&'a str> = HashSet::with_capacity(records.len());
    let mut unique = Vec::with_capacity(records.len());
    for &record in records {
        if seen.insert(record.device_id()) {
            unique.push(record);
        }
    }
    unique
}
