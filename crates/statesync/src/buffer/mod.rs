//! Durable, append-only buffer of state events.
//!
//! # Guarantees
//!
//! - **Durable once enqueued**: a record is written to the active segment
//!   before `enqueue` returns (and `fsync`ed when `sync_on_append` is set;
//!   `enqueue` runs that fsync on the blocking pool, outside the queue lock)
//! - **Arrival order**: seqs are assigned under one lock, so records for the
//!   same device keep the order producers enqueued them in
//! - **Prefix commits**: flushes always take the oldest records, so removal
//!   is a single watermark (`commit_through`) persisted in `checkpoint`
//! - **Exclusive**: one open instance per directory in this process
//!
//! # Example
//!
//! ```ignore
//! let buffer = DurableBuffer::open(&config)?;
//! buffer.enqueue(StateEvent::now("dev-1")).await?;
//!
//! let batch = buffer.peek_batch(1000);
//! // ... reconcile ...
//! if let Some(last) = batch.last() {
//!     buffer.commit_through(last.seq)?;
//! }
//! ```

mod segment;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Instant;

use dashmap::DashSet;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{OverflowPolicy, SyncConfig};
use crate::core::{BufferedRecord, StateEvent};
use crate::error::BufferError;
use segment::SegmentWriter;

/// Directories currently owned by an open buffer.
static OPEN_DIRS: LazyLock<DashSet<PathBuf>> = LazyLock::new(DashSet::new);

#[derive(Debug, Clone)]
struct Pending {
    record: BufferedRecord,
    enqueued_at: Instant,
}

struct Appended {
    seq: u64,
    /// Segment the record went to, still to be fsynced.
    unsynced: Option<std::fs::File>,
}

#[derive(Debug)]
struct SealedSegment {
    path: PathBuf,
    last_seq: u64,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<Pending>,
    next_seq: u64,
    committed: u64,
    sealed: VecDeque<SealedSegment>,
    writer: Option<SegmentWriter>,
}

struct Inner {
    dir: PathBuf,
    max_pending: usize,
    overflow: OverflowPolicy,
    segment_capacity: usize,
    sync_on_append: bool,
    state: Mutex<QueueState>,
    /// Woken when records are removed or the buffer closes.
    space: Notify,
    /// Woken when the scheduler should look at the queue.
    ready: Notify,
    trigger_at: AtomicUsize,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        OPEN_DIRS.remove(&self.dir);
    }
}

/// Durable buffer handle. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct DurableBuffer {
    inner: Arc<Inner>,
}

impl DurableBuffer {
    /// Open (or create) the buffer directory `config.buffer_dir()` and
    /// recover every uncommitted record.
    pub fn open(config: &SyncConfig) -> Result<Self, BufferError> {
        let dir = config.buffer_dir();
        std::fs::create_dir_all(&dir)?;
        let dir = std::fs::canonicalize(&dir)?;

        if !OPEN_DIRS.insert(dir.clone()) {
            return Err(BufferError::InUse(dir));
        }

        let state = match recover(&dir, config.segment_capacity) {
            Ok(state) => state,
            Err(e) => {
                OPEN_DIRS.remove(&dir);
                return Err(e);
            }
        };

        info!(
            dir = %dir.display(),
            pending = state.pending.len(),
            next_seq = state.next_seq,
            "durable buffer opened"
        );

        let buffer = Self {
            inner: Arc::new(Inner {
                dir,
                max_pending: config.max_pending,
                overflow: config.overflow,
                segment_capacity: config.segment_capacity,
                sync_on_append: config.sync_on_append,
                state: Mutex::new(state),
                space: Notify::new(),
                ready: Notify::new(),
                trigger_at: AtomicUsize::new(config.batch_size),
                closed: AtomicBool::new(false),
            }),
        };

        // Recovered records should be flushed without waiting for new traffic.
        if !buffer.is_empty() {
            buffer.inner.ready.notify_one();
        }
        Ok(buffer)
    }

    /// Append an event, honoring the overflow policy.
    ///
    /// Returns the record's seq. Never waits for reconciliation; under
    /// [`OverflowPolicy::Block`] it waits only while the buffer is full.
    pub async fn enqueue(&self, event: StateEvent) -> Result<u64, BufferError> {
        loop {
            // Register before checking so a commit in between is not missed.
            let space = self.inner.space.notified();

            match self.append(&event, false) {
                Err(BufferError::Full { .. }) if self.inner.overflow == OverflowPolicy::Block => {
                    debug!(device_id = %event.device_id, "buffer full, waiting for space");
                    space.await;
                }
                Ok(Appended { seq, unsynced: Some(file) }) => {
                    // fsync on the blocking pool, not on a runtime worker.
                    tokio::task::spawn_blocking(move || file.sync_data())
                        .await
                        .map_err(|e| std::io::Error::other(e.to_string()))??;
                    return Ok(seq);
                }
                Ok(Appended { seq, unsynced: None }) => return Ok(seq),
                Err(e) => return Err(e),
            }
        }
    }

    /// Append an event without waiting; fails with `Full` at capacity
    /// regardless of the configured policy.
    ///
    /// With `sync_on_append` the fsync runs on the calling thread, so prefer
    /// [`enqueue`](Self::enqueue) from async code.
    pub fn try_enqueue(&self, event: StateEvent) -> Result<u64, BufferError> {
        self.append(&event, true).map(|appended| appended.seq)
    }

    /// Write one record. With `sync_on_append` and `inline_sync == false`
    /// the fsync is left to the caller through `unsynced`.
    fn append(&self, event: &StateEvent, inline_sync: bool) -> Result<Appended, BufferError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }

        let mut state = self.lock();
        if state.pending.len() >= self.inner.max_pending {
            return Err(BufferError::Full {
                max_pending: self.inner.max_pending,
            });
        }

        let record = BufferedRecord {
            seq: state.next_seq,
            event: event.clone(),
        };

        let needs_roll = state
            .writer
            .as_ref()
            .map(|w| w.damaged || w.records >= self.inner.segment_capacity)
            .unwrap_or(true);
        if needs_roll {
            if let Some(full) = state.writer.take() {
                match full.sync() {
                    Ok(()) => {}
                    Err(e) if full.damaged => {
                        warn!(path = %full.path().display(), error = %e, "sealing damaged segment without sync");
                    }
                    Err(e) => return Err(e),
                }
                state.sealed.push_back(SealedSegment {
                    path: full.path().to_path_buf(),
                    last_seq: full.last_seq,
                });
            }
            state.writer = Some(SegmentWriter::open(&self.inner.dir, record.seq)?);
        }

        let defer_sync = self.inner.sync_on_append && !inline_sync;
        let mut unsynced = None;
        if let Some(writer) = state.writer.as_mut() {
            let written = writer
                .append(&record, self.inner.sync_on_append && inline_sync)
                .and_then(|()| {
                    if defer_sync {
                        unsynced = Some(writer.try_clone_file()?);
                    }
                    Ok(())
                });
            if let Err(e) = written {
                // The seq may already be on disk in a damaged segment.
                state.next_seq += 1;
                return Err(e);
            }
        }

        let seq = record.seq;
        state.next_seq += 1;
        state.pending.push_back(Pending {
            record,
            enqueued_at: Instant::now(),
        });

        let len = state.pending.len();
        drop(state);

        if len == 1 || len >= self.inner.trigger_at.load(Ordering::Acquire) {
            self.inner.ready.notify_one();
        }
        Ok(Appended { seq, unsynced })
    }

    /// The oldest `limit` pending records, in arrival order.
    pub fn peek_batch(&self, limit: usize) -> Vec<BufferedRecord> {
        self.lock()
            .pending
            .iter()
            .take(limit)
            .map(|p| p.record.clone())
            .collect()
    }

    /// Remove every pending record with `seq <= through`.
    ///
    /// Persists the watermark and deletes segments that hold only committed
    /// records. Returns the number of records removed.
    pub fn commit_through(&self, through: u64) -> Result<usize, BufferError> {
        let mut state = self.lock();
        if through <= state.committed {
            return Ok(0);
        }

        let mut removed = 0;
        while state
            .pending
            .front()
            .is_some_and(|p| p.record.seq <= through)
        {
            state.pending.pop_front();
            removed += 1;
        }

        segment::write_checkpoint(&self.inner.dir, through)?;
        state.committed = through;

        while state.sealed.front().is_some_and(|s| s.last_seq <= through) {
            if let Some(sealed) = state.sealed.pop_front() {
                if let Err(e) = std::fs::remove_file(&sealed.path) {
                    warn!(path = %sealed.path.display(), error = %e, "failed to delete committed segment");
                }
            }
        }
        drop(state);

        self.inner.space.notify_waiters();
        Ok(removed)
    }

    /// Number of records waiting for a flush.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the oldest pending record was enqueued (or recovered).
    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.lock().pending.front().map(|p| p.enqueued_at)
    }

    /// Highest committed seq.
    pub fn committed_through(&self) -> u64 {
        self.lock().committed
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flush the active segment to stable storage.
    pub fn sync(&self) -> Result<(), BufferError> {
        match self.lock().writer.as_ref() {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    /// Stop accepting records, sync and release the active segment.
    ///
    /// Pending records stay on disk for the next `open`. Idempotent.
    pub fn close(&self) -> Result<(), BufferError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let writer = self.lock().writer.take();
        self.inner.space.notify_waiters();
        self.inner.ready.notify_one();
        if let Some(writer) = writer {
            writer.sync()?;
        }
        info!(dir = %self.inner.dir.display(), pending = self.len(), "durable buffer closed");
        Ok(())
    }

    /// Wait until the scheduler has something to look at.
    pub(crate) async fn wait_ready(&self) {
        self.inner.ready.notified().await
    }

    /// Pending count at which producers wake the scheduler early.
    pub(crate) fn set_trigger_threshold(&self, n: usize) {
        self.inner.trigger_at.store(n.max(1), Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves the queue consistent (every
        // mutation is a single push/pop), so recover the guard.
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for DurableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBuffer")
            .field("dir", &self.inner.dir)
            .field("pending", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn recover(dir: &Path, segment_capacity: usize) -> Result<QueueState, BufferError> {
    let committed = segment::read_checkpoint(dir)?;
    let segments = segment::list_segments(dir)?;
    let now = Instant::now();

    let mut pending = VecDeque::new();
    let mut sealed = VecDeque::new();
    let mut max_seq = committed;
    let mut tail: Option<(u64, u64, usize)> = None;
    let count = segments.len();

    for (index, (first_seq, path)) in segments.into_iter().enumerate() {
        let is_tail = index + 1 == count;
        let records = segment::replay_segment(&path, is_tail)?;
        let last_seq = records.last().map(|r| r.seq).unwrap_or(first_seq.saturating_sub(1));
        max_seq = max_seq.max(last_seq);

        if !is_tail && last_seq <= committed {
            std::fs::remove_file(&path)?;
            continue;
        }

        for record in records.iter().filter(|r| r.seq > committed) {
            pending.push_back(Pending {
                record: record.clone(),
                enqueued_at: now,
            });
        }

        if is_tail {
            tail = Some((first_seq, last_seq, records.len()));
        } else {
            sealed.push_back(SealedSegment { path, last_seq });
        }
    }

    let writer = match tail {
        Some((first_seq, last_seq, records)) if records < segment_capacity => Some(
            SegmentWriter::resume(dir, first_seq, last_seq, records)?,
        ),
        Some((first_seq, last_seq, _)) => {
            sealed.push_back(SealedSegment {
                path: segment::segment_path(dir, first_seq),
                last_seq,
            });
            None
        }
        None => None,
    };

    Ok(QueueState {
        pending,
        next_seq: max_seq + 1,
        committed,
        sealed,
        writer,
    })
}
