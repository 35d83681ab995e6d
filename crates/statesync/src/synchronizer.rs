//! Wiring and lifecycle.
//!
//! [`StateSynchronizer`] assembles the buffer, flusher, scheduler and
//! dispatch table; [`SyncHandle`] owns the running tasks.
//!
//! ```text
//! EventBus ──► dispatch loop ──► DurableBuffer.enqueue
//!                   │                    │
//!                   │                    ▼ ready / deadline
//!                   │              BatchScheduler ──► Flusher.flush_once
//!                   ▼
//!          HierarchyService.bind_child / unbind_child
//! ```
//!
//! Shutdown order: dispatch stops first so nothing new is buffered (a
//! handler blocked on a full buffer is abandoned), then the scheduler gets
//! one bounded final flush, then the buffer is synced and closed even if
//! the sync fails. Whatever is left stays on disk for the next start.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! let handle = StateSynchronizer::builder(config, registry, repository)
//!     .with_hierarchy(HierarchyService::new(store))
//!     .start(&bus)?;
//!
//! bus.publish(DeviceMessage::online("thermostat", "device-1"));
//!
//! handle.shutdown().await?;
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::DurableBuffer;
use crate::bus::{BusMessage, DeviceMessageKind, EventBus, InvalidTopicPattern};
use crate::config::SyncConfig;
use crate::dispatch::{DispatchTable, Subscription};
use crate::error::{BufferError, ConfigError};
use crate::flush::{FlushReport, Flusher};
use crate::hierarchy::HierarchyService;
use crate::reconciler::{BulkReconciler, DeviceRepository, GroupOutcome};
use crate::resolver::{CanonicalStateSource, StateResolver};
use crate::retry::RetryPolicy;
use crate::scheduler::{BatchScheduler, FlushTrigger};

/// Topic a gateway uses to report a new child device.
pub const CHILD_REGISTER_TOPIC: &str = "/device/*/*/message/children/*/register";

/// Topic a gateway uses to report a removed child device.
pub const CHILD_UNREGISTER_TOPIC: &str = "/device/*/*/message/children/*/unregister";

/// Why the synchronizer could not start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Topic(#[from] InvalidTopicPattern),
}

/// Collects collaborators before starting.
pub struct StateSynchronizer {
    config: SyncConfig,
    registry: Arc<dyn CanonicalStateSource>,
    repository: Arc<dyn DeviceRepository>,
    hierarchy: Option<HierarchyService>,
}

impl StateSynchronizer {
    pub fn builder(
        config: SyncConfig,
        registry: Arc<dyn CanonicalStateSource>,
        repository: Arc<dyn DeviceRepository>,
    ) -> Self {
        Self {
            config,
            registry,
            repository,
            hierarchy: None,
        }
    }

    /// Also handle child register/unregister messages.
    pub fn with_hierarchy(mut self, hierarchy: HierarchyService) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    /// Open the buffer, subscribe to `bus` and spawn the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self, bus: &EventBus) -> Result<SyncHandle, StartError> {
        let config = self.config;
        config.validate()?;

        let buffer = DurableBuffer::open(&config)?;
        let resolver = StateResolver::new(
            self.registry,
            config.lookup_concurrency,
            config.lookup_timeout,
        );
        let reconciler = BulkReconciler::new(
            self.repository,
            RetryPolicy::new(config.retryable.iter().copied()),
            config.write_concurrency,
            config.write_timeout,
        );
        let flusher = Flusher::new(buffer.clone(), resolver, reconciler, &config);

        let table = build_table(&config, &buffer, self.hierarchy)?;
        let (scheduler, trigger) = BatchScheduler::new(flusher.clone(), &config);

        let cancel = CancellationToken::new();
        let dispatch_cancel = cancel.child_token();
        let scheduler_cancel = cancel.child_token();

        let receiver = bus.subscribe();
        let dispatch = tokio::spawn(table.run(receiver, dispatch_cancel.clone()));
        let scheduler = tokio::spawn(scheduler.run(scheduler_cancel.clone()));

        info!(
            name = %config.name,
            dir = %buffer.dir().display(),
            pending = buffer.len(),
            "state synchronizer started"
        );

        Ok(SyncHandle {
            buffer,
            flusher,
            trigger,
            cancel,
            tasks: Mutex::new(Some(Tasks {
                dispatch,
                dispatch_cancel,
                scheduler,
                scheduler_cancel,
            })),
        })
    }
}

fn build_table(
    config: &SyncConfig,
    buffer: &DurableBuffer,
    hierarchy: Option<HierarchyService>,
) -> Result<DispatchTable, InvalidTopicPattern> {
    let mut table = DispatchTable::new(Subscription::new(
        config.subscriber_id.clone(),
        Vec::<String>::new(),
    )?);

    for topic in &config.topics {
        let buffer = buffer.clone();
        table = table.route(topic, "buffer-state", move |message: BusMessage| {
            let buffer = buffer.clone();
            async move {
                if let Some(event) = message.message.state_event() {
                    buffer.enqueue(event).await?;
                }
                Ok::<_, anyhow::Error>(())
            }
        })?;
    }

    if let Some(hierarchy) = hierarchy {
        let service = hierarchy.clone();
        table = table.route(CHILD_REGISTER_TOPIC, "bind-child", move |message: BusMessage| {
            let service = service.clone();
            async move {
                if let DeviceMessageKind::ChildRegister { child_id } = &message.message.kind {
                    service.bind_child(&message.message.device_id, child_id).await?;
                }
                Ok::<_, anyhow::Error>(())
            }
        })?;

        table = table.route(CHILD_UNREGISTER_TOPIC, "unbind-child", move |message: BusMessage| {
            let service = hierarchy.clone();
            async move {
                if let DeviceMessageKind::ChildUnregister { child_id } = &message.message.kind {
                    service.unbind_child(child_id).await?;
                }
                Ok::<_, anyhow::Error>(())
            }
        })?;
    }

    Ok(table)
}

struct Tasks {
    dispatch: JoinHandle<()>,
    dispatch_cancel: CancellationToken,
    scheduler: JoinHandle<()>,
    scheduler_cancel: CancellationToken,
}

/// A running synchronizer.
///
/// Dropping the handle cancels both tasks. The scheduler still attempts its
/// final flush in the background but nothing waits for it; call
/// [`shutdown`](Self::shutdown) for an orderly stop.
pub struct SyncHandle {
    buffer: DurableBuffer,
    flusher: Flusher,
    trigger: FlushTrigger,
    cancel: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl SyncHandle {
    pub fn buffer(&self) -> &DurableBuffer {
        &self.buffer
    }

    /// Flush immediately on the scheduler task.
    pub async fn flush_now(&self) -> Result<FlushReport, BufferError> {
        self.trigger.flush_now().await
    }

    /// Resolve and write the given devices outside the buffer.
    pub async fn sync_state_batch(&self, device_ids: Vec<String>, force: bool) -> Vec<GroupOutcome> {
        self.flusher.sync_state_batch(device_ids, force).await
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop dispatch, run the final flush, then sync and close the buffer.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), BufferError> {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };

        tasks.dispatch_cancel.cancel();
        if let Err(e) = tasks.dispatch.await {
            error!(error = %e, "dispatch task did not stop cleanly");
        }

        tasks.scheduler_cancel.cancel();
        if let Err(e) = tasks.scheduler.await {
            error!(error = %e, "scheduler task did not stop cleanly");
        }

        self.cancel.cancel();
        let synced = self.buffer.sync();
        if let Err(e) = &synced {
            error!(error = %e, "failed to sync buffer on shutdown");
        }
        let closed = self.buffer.close();
        info!(left_pending = self.buffer.len(), "state synchronizer stopped");
        synced.and(closed)
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("buffer", &self.buffer)
            .field("running", &self.is_running())
            .finish()
    }
}
