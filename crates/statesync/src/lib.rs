//! # Statesync
//!
//! Durable, batched reconciliation of device online/offline state, plus
//! cycle-safe edits of the device parent/child hierarchy.
//!
//! ## Architecture
//!
//! ```text
//! /device/*/*/online, /offline
//!     │
//!     ▼ EventBus (local only)
//! DispatchTable ──► DurableBuffer.enqueue ──► segment files + checkpoint
//!                          │
//!                          ▼ batch_size reached or flush_timeout elapsed
//!                   BatchScheduler (one flush in flight)
//!                          │
//!                          ▼
//!     filter_effective ─► dedup_first_wins ─► StateResolver
//!                                                  │
//!                                                  ▼
//!                                    BulkReconciler, one write per state
//!                                                  │
//!                       ┌──────────────────────────┴──────────────┐
//!                       ▼                                         ▼
//!              retryable failure                          written / permanent
//!              batch stays queued                         commit_through(seq)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Accepted means durable** - `enqueue` returns after the record is
//!    appended to the current segment
//! 2. **Committed means gone** - a committed record is never reconciled again
//! 3. **First arrival wins** - at most one state write per device per flush
//! 4. **notActive is sticky** - only a `notActive` write touches a
//!    `notActive` device
//! 5. **Quiet writes** - reconciliation never emits change events
//! 6. **Acyclic hierarchy** - a parent edge that would close a loop is
//!    rejected before any write
//!
//! ## Guarantees
//!
//! - **At-least-once reconciliation**: a batch hit by a transient failure is
//!   re-run in full; writes are absolute, so re-running is harmless
//! - **Bounded memory**: producers block (or are shed) at `max_pending`
//! - **Single process**: one buffer directory belongs to one process
//!
//! ## Example
//!
//! ```ignore
//! use statesync::{EventBus, DeviceMessage, StateSynchronizer, SyncConfig};
//!
//! let bus = EventBus::new();
//! let handle = StateSynchronizer::builder(SyncConfig::default(), registry, repository)
//!     .start(&bus)?;
//!
//! bus.publish(DeviceMessage::online("thermostat", "device-1"));
//! bus.publish(DeviceMessage::offline("thermostat", "device-2"));
//!
//! // Later
//! handle.shutdown().await?;
//! ```

// Core modules
mod buffer;
mod bus;
mod config;
mod core;
mod dispatch;
mod error;
mod flush;
mod reconciler;
mod resolver;
mod scheduler;
mod synchronizer;

// Pure batch stages
pub mod pipeline;

// Failure classification
pub mod retry;

// Device hierarchy
pub mod hierarchy;

// Re-export data model
pub use crate::core::{
    BufferedRecord, CanonicalState, DeviceState, DeviceStateInfo, HierarchyEdge,
    ReconciliationGroup, ResolvedDevice, StateEvent,
};

// Re-export error types
pub use crate::error::{BufferError, ConfigError, QueryTimeout};

// Re-export configuration
pub use config::{OverflowPolicy, SyncConfig, DEFAULT_NAME, DEFAULT_TOPICS};

// Re-export buffer types
pub use buffer::DurableBuffer;

// Re-export bus and dispatch types
pub use bus::{BusMessage, DeviceMessage, DeviceMessageKind, EventBus, InvalidTopicPattern, TopicPattern};
pub use dispatch::{DispatchTable, Subscription};

// Re-export pipeline collaborators
pub use reconciler::{
    group_by_state, BulkReconciler, DeviceRepository, GroupOutcome, GroupResult, WriteOptions,
};
pub use resolver::{CanonicalStateSource, StateResolver};
pub use retry::{FailureKind, RetryPolicy, RetryableKind};

// Re-export flush and scheduling
pub use flush::{FlushOutcome, FlushReport, Flusher};
pub use scheduler::{BatchScheduler, FlushTrigger};

// Re-export lifecycle types (primary entry point)
pub use synchronizer::{
    StartError, StateSynchronizer, SyncHandle, CHILD_REGISTER_TOPIC, CHILD_UNREGISTER_TOPIC,
};

// Re-export hierarchy types
pub use hierarchy::{CycleChecker, HierarchyError, HierarchyService, HierarchyStore};

// Re-export commonly used external types
pub use async_trait::async_trait;
