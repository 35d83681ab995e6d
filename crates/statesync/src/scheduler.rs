//! Size-or-timeout flush scheduling with single-flight execution.
//!
//! The scheduler is one task per buffer. It sleeps until either
//! `batch_size` records are pending or the oldest pending record has waited
//! `flush_timeout`, then runs a flush inline. Because flushes run on the
//! scheduler task itself, at most one is ever in flight; wake-ups that
//! arrive during a flush coalesce into a single stored permit and are
//! handled by the next cycle.
//!
//! Manual flushes ([`FlushTrigger::flush_now`]) go through the same task,
//! so they never overlap a scheduled one either.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::BufferError;
use crate::flush::{FlushOutcome, FlushReport, Flusher};

type FlushReply = oneshot::Sender<Result<FlushReport, BufferError>>;

/// Requests an immediate flush from a running scheduler.
#[derive(Debug, Clone)]
pub struct FlushTrigger {
    requests: mpsc::Sender<FlushReply>,
}

impl FlushTrigger {
    /// Flush now and return the report.
    ///
    /// Fails with `BufferError::Closed` once the scheduler has stopped.
    pub async fn flush_now(&self) -> Result<FlushReport, BufferError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| BufferError::Closed)?;
        response.await.map_err(|_| BufferError::Closed)?
    }
}

enum Trigger {
    Scheduled,
    Manual(FlushReply),
    Cancelled,
}

/// Drives flushes for one buffer.
pub struct BatchScheduler {
    flusher: Flusher,
    requests: mpsc::Receiver<FlushReply>,
    batch_size: usize,
    flush_timeout: Duration,
    retry_backoff: Duration,
    shutdown_grace: Duration,
}

impl BatchScheduler {
    pub fn new(flusher: Flusher, config: &SyncConfig) -> (Self, FlushTrigger) {
        let (tx, rx) = mpsc::channel(8);
        flusher.buffer().set_trigger_threshold(config.batch_size);
        let scheduler = Self {
            flusher,
            requests: rx,
            batch_size: config.batch_size,
            flush_timeout: config.flush_timeout,
            retry_backoff: config.retry_backoff,
            shutdown_grace: config.shutdown_grace,
        };
        (scheduler, FlushTrigger { requests: tx })
    }

    /// Run until `cancel` fires, then make one bounded final flush attempt.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            batch_size = self.batch_size,
            flush_timeout_ms = self.flush_timeout.as_millis() as u64,
            "batch scheduler started"
        );

        loop {
            match self.next_trigger(&cancel).await {
                Trigger::Cancelled => break,
                Trigger::Manual(reply) => {
                    let result = self.flusher.flush_once().await;
                    let retry = matches!(&result, Ok(r) if r.outcome == FlushOutcome::Retry);
                    let _ = reply.send(result);
                    if retry && self.back_off(&cancel).await {
                        break;
                    }
                }
                Trigger::Scheduled => {
                    let backoff = match self.flusher.flush_once().await {
                        Ok(report) => report.outcome == FlushOutcome::Retry,
                        Err(e) => {
                            error!(error = %e, "flush failed to update the buffer");
                            true
                        }
                    };
                    if backoff && self.back_off(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.final_flush().await;
    }

    /// Sleep for the retry backoff. Returns `true` if cancelled meanwhile.
    async fn back_off(&self, cancel: &CancellationToken) -> bool {
        debug!(backoff_ms = self.retry_backoff.as_millis() as u64, "backing off before next flush");
        tokio::select! {
            _ = tokio::time::sleep(self.retry_backoff) => false,
            _ = cancel.cancelled() => true,
        }
    }

    async fn next_trigger(&mut self, cancel: &CancellationToken) -> Trigger {
        let buffer = self.flusher.buffer().clone();
        loop {
            if cancel.is_cancelled() {
                return Trigger::Cancelled;
            }
            if buffer.len() >= self.batch_size {
                return Trigger::Scheduled;
            }

            let deadline = buffer.oldest_enqueued_at().map(|t| t + self.flush_timeout);
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Trigger::Scheduled;
            }

            let timeout = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Trigger::Cancelled,
                Some(reply) = self.requests.recv() => return Trigger::Manual(reply),
                _ = timeout => return Trigger::Scheduled,
                _ = buffer.wait_ready() => {}
            }
        }
    }

    /// Drain what can be drained within the shutdown grace period.
    async fn final_flush(&self) {
        let buffer = self.flusher.buffer();
        if buffer.is_empty() {
            info!("batch scheduler stopped, buffer empty");
            return;
        }

        let drain = async {
            while !buffer.is_empty() {
                match self.flusher.flush_once().await {
                    Ok(report) if report.outcome == FlushOutcome::Committed => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!(error = %e, "final flush failed to update the buffer");
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "final flush did not finish within the grace period"
            );
        }
        info!(left_pending = buffer.len(), "batch scheduler stopped");
    }
}
