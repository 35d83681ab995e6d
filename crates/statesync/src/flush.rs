//! One flush: drain, filter, dedup, resolve, reconcile, commit.
//!
//! ```text
//! DurableBuffer.peek_batch(batch_size)
//!     │
//!     ▼ filter_effective (ttl)      stale → counted, committed, never written
//!     ▼ dedup_first_wins            one entry per device
//!     ▼ StateResolver.resolve_all   bounded concurrent lookups, fallbacks
//!     ▼ BulkReconciler.reconcile    one conditional write per state group
//!     │
//!     ├─ any retryable group failure → keep batch queued (Retry)
//!     └─ otherwise                   → commit_through(last seq) (Committed)
//! ```
//!
//! Re-running a batch after a retryable failure is safe: every write sets an
//! absolute state, so groups that already succeeded are simply written
//! again with the same value.

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::buffer::DurableBuffer;
use crate::config::SyncConfig;
use crate::core::DeviceStateInfo;
use crate::error::BufferError;
use crate::pipeline::{dedup_first_wins, filter_effective};
use crate::reconciler::{BulkReconciler, GroupOutcome};
use crate::resolver::StateResolver;

/// How a flush ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    /// The batch was removed from the buffer.
    Committed,
    /// A retryable failure kept the batch queued.
    Retry,
}

/// Everything a flush did, for logging and tests.
#[derive(Debug)]
pub struct FlushReport {
    pub flush_id: Uuid,
    /// Records taken from the buffer.
    pub taken: usize,
    /// Records dropped by the TTL filter.
    pub stale: usize,
    /// Records collapsed by dedup.
    pub duplicates: usize,
    pub groups: Vec<GroupOutcome>,
    /// Watermark committed by this flush, if any.
    pub committed_through: Option<u64>,
    pub outcome: FlushOutcome,
}

impl FlushReport {
    fn empty(flush_id: Uuid) -> Self {
        Self {
            flush_id,
            taken: 0,
            stale: 0,
            duplicates: 0,
            groups: Vec::new(),
            committed_through: None,
            outcome: FlushOutcome::Empty,
        }
    }

    /// Devices whose state was written.
    pub fn infos(&self) -> Vec<DeviceStateInfo> {
        self.groups.iter().flat_map(GroupOutcome::infos).collect()
    }
}

/// Runs flushes against one buffer.
#[derive(Debug, Clone)]
pub struct Flusher {
    buffer: DurableBuffer,
    resolver: StateResolver,
    reconciler: BulkReconciler,
    batch_size: usize,
    ttl: std::time::Duration,
}

impl Flusher {
    pub fn new(
        buffer: DurableBuffer,
        resolver: StateResolver,
        reconciler: BulkReconciler,
        config: &SyncConfig,
    ) -> Self {
        Self {
            buffer,
            resolver,
            reconciler,
            batch_size: config.batch_size,
            ttl: config.ttl,
        }
    }

    pub fn buffer(&self) -> &DurableBuffer {
        &self.buffer
    }

    pub async fn flush_once(&self) -> Result<FlushReport, BufferError> {
        self.flush_once_at(Utc::now()).await
    }

    /// Flush with an explicit clock reading for the TTL filter.
    pub async fn flush_once_at(&self, now: DateTime<Utc>) -> Result<FlushReport, BufferError> {
        let flush_id = Uuid::new_v4();
        self.run(flush_id, now)
            .instrument(info_span!("flush", %flush_id))
            .await
    }

    async fn run(&self, flush_id: Uuid, now: DateTime<Utc>) -> Result<FlushReport, BufferError> {
        let batch = self.buffer.peek_batch(self.batch_size);
        let Some(last_seq) = batch.last().map(|r| r.seq) else {
            return Ok(FlushReport::empty(flush_id));
        };

        let (effective, stale) = filter_effective(&batch, now, self.ttl);
        let unique = dedup_first_wins(&effective);
        let duplicates = effective.len() - unique.len();
        let device_ids: Vec<String> = unique.iter().map(|r| r.device_id().to_string()).collect();

        debug!(
            taken = batch.len(),
            stale,
            duplicates,
            devices = device_ids.len(),
            "flushing state buffer"
        );

        let groups = if device_ids.is_empty() {
            Vec::new()
        } else {
            let resolved = self.resolver.resolve_all(device_ids, false).await;
            self.reconciler.reconcile(resolved).await
        };

        if groups.iter().any(GroupOutcome::is_retryable) {
            return Ok(FlushReport {
                flush_id,
                taken: batch.len(),
                stale,
                duplicates,
                groups,
                committed_through: None,
                outcome: FlushOutcome::Retry,
            });
        }

        self.buffer.commit_through(last_seq)?;
        info!(
            taken = batch.len(),
            stale,
            written = groups.iter().filter(|g| g.is_written()).count(),
            dropped = groups.iter().filter(|g| !g.is_written()).count(),
            committed_through = last_seq,
            "state buffer flushed"
        );

        Ok(FlushReport {
            flush_id,
            taken: batch.len(),
            stale,
            duplicates,
            groups,
            committed_through: Some(last_seq),
            outcome: FlushOutcome::Committed,
        })
    }

    /// Resolve and reconcile an explicit list of devices, bypassing the
    /// buffer. Duplicate ids are collapsed.
    ///
    /// With `force` each device is actively probed before writing.
    pub async fn sync_state_batch(&self, device_ids: Vec<String>, force: bool) -> Vec<GroupOutcome> {
        let mut seen = std::collections::HashSet::new();
        let unique: Vec<String> = device_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if unique.is_empty() {
            return Vec::new();
        }
        let resolved = self.resolver.resolve_all(unique, force).await;
        self.reconciler.reconcile(resolved).await
    }
}
