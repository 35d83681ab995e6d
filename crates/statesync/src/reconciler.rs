//! Grouped, conditional bulk writes of resolved device states.
//!
//! Resolved devices are grouped by target state and each group becomes one
//! `bulk_set_state` call. Groups are disjoint, so they are written
//! concurrently and fail independently.
//!
//! Two rules hold for every write:
//!
//! 1. A device persisted as `notActive` is only touched when the target
//!    state is itself `notActive` (`skip_if_not_active`). Stale buffered
//!    events must not resurrect a deactivated device.
//! 2. The write is tagged to suppress change events. Reconciliation is a
//!    housekeeping sync; emitting change events would feed straight back
//!    into the topics this pipeline consumes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, warn};

use crate::core::{DeviceState, DeviceStateInfo, ReconciliationGroup, ResolvedDevice};
use crate::error::QueryTimeout;
use crate::retry::{FailureKind, RetryPolicy};

/// Flags attached to a bulk state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Leave rows whose current state is `notActive` untouched.
    pub skip_if_not_active: bool,
    /// Do not emit entity change events for this write.
    pub suppress_change_events: bool,
}

impl WriteOptions {
    /// Options the reconciler uses when writing `state`.
    pub fn for_target(state: DeviceState) -> Self {
        Self {
            skip_if_not_active: state != DeviceState::NotActive,
            suppress_change_events: true,
        }
    }
}

/// Durable device storage.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Set `state` on every device in `ids`, honoring `options`.
    ///
    /// Returns the number of rows changed.
    async fn bulk_set_state(
        &self,
        ids: &[String],
        state: DeviceState,
        options: WriteOptions,
    ) -> Result<u64>;
}

/// Group resolved devices by target state, in state order.
///
/// Devices keep their relative order within a group.
pub fn group_by_state(resolved: Vec<ResolvedDevice>) -> Vec<ReconciliationGroup> {
    let mut groups: BTreeMap<DeviceState, Vec<ResolvedDevice>> = BTreeMap::new();
    for device in resolved {
        groups.entry(device.state).or_default().push(device);
    }
    groups
        .into_iter()
        .map(|(state, devices)| ReconciliationGroup { state, devices })
        .collect()
}

/// What happened to one group's write.
#[derive(Debug)]
pub enum GroupResult {
    Written { rows: u64 },
    Failed { error: anyhow::Error, kind: FailureKind },
}

/// A group together with its write result.
#[derive(Debug)]
pub struct GroupOutcome {
    pub group: ReconciliationGroup,
    pub result: GroupResult,
}

impl GroupOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self.result, GroupResult::Written { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.result,
            GroupResult::Failed {
                kind: FailureKind::Retryable,
                ..
            }
        )
    }

    /// Per-device results for a written group; empty for a failed one.
    pub fn infos(&self) -> Vec<DeviceStateInfo> {
        if !self.is_written() {
            return Vec::new();
        }
        self.group
            .devices
            .iter()
            .map(|d| DeviceStateInfo {
                device_id: d.device_id.clone(),
                state: self.group.state,
            })
            .collect()
    }
}

/// Issues one conditional bulk update per state group.
#[derive(Clone)]
pub struct BulkReconciler {
    repository: Arc<dyn DeviceRepository>,
    policy: RetryPolicy,
    concurrency: usize,
    timeout: Duration,
}

impl BulkReconciler {
    pub fn new(
        repository: Arc<dyn DeviceRepository>,
        policy: RetryPolicy,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            policy,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Group and write. One outcome per group, ordered by state.
    pub async fn reconcile(&self, resolved: Vec<ResolvedDevice>) -> Vec<GroupOutcome> {
        let groups = group_by_state(resolved);
        let mut outcomes: Vec<GroupOutcome> = stream::iter(groups)
            .map(|group| self.write_group(group))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.group.state);
        outcomes
    }

    async fn write_group(&self, group: ReconciliationGroup) -> GroupOutcome {
        let ids = group.device_ids();
        let options = WriteOptions::for_target(group.state);

        let written = tokio::time::timeout(
            self.timeout,
            self.repository.bulk_set_state(&ids, group.state, options),
        )
        .await
        .unwrap_or_else(|_| Err(QueryTimeout::new("bulk_set_state", self.timeout).into()));

        let result = match written {
            Ok(rows) => {
                debug!(state = %group.state, devices = ids.len(), rows, "state group reconciled");
                GroupResult::Written { rows }
            }
            Err(error) => {
                let kind = self.policy.classify(&error);
                match kind {
                    FailureKind::Retryable => warn!(
                        state = %group.state,
                        devices = ids.len(),
                        error = ?error,
                        "state group write failed, will retry"
                    ),
                    FailureKind::NonRetryable => error!(
                        state = %group.state,
                        devices = ids.len(),
                        error = ?error,
                        "state group write failed permanently, dropping"
                    ),
                }
                GroupResult::Failed { error, kind }
            }
        };

        GroupOutcome { group, result }
    }
}

impl std::fmt::Debug for BulkReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkReconciler")
            .field("policy", &self.policy)
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn resolved(id: &str, state: DeviceState) -> ResolvedDevice {
        ResolvedDevice {
            device_id: id.into(),
            state,
            is_gateway: false,
        }
    }

    #[derive(Default)]
    struct RecordingRepository {
        writes: Mutex<Vec<(Vec<String>, DeviceState, WriteOptions)>>,
        fail_state: Option<(DeviceState, bool)>,
    }

    #[async_trait]
    impl DeviceRepository for RecordingRepository {
        async fn bulk_set_state(
            &self,
            ids: &[String],
            state: DeviceState,
            options: WriteOptions,
        ) -> Result<u64> {
            if let Some((failing, transient)) = self.fail_state {
                if failing == state {
                    if transient {
                        return Err(std::io::Error::other("connection reset").into());
                    }
                    anyhow::bail!("syntax error at or near \"WHERE\"");
                }
            }
            self.writes
                .lock()
                .unwrap()
                .push((ids.to_vec(), state, options));
            Ok(ids.len() as u64)
        }
    }

    fn reconciler(repo: Arc<RecordingRepository>) -> BulkReconciler {
        BulkReconciler::new(repo, RetryPolicy::default(), 2, Duration::from_secs(1))
    }

    #[test]
    fn test_group_by_state_preserves_order_within_group() {
        let groups = group_by_state(vec![
            resolved("a", DeviceState::Online),
            resolved("b", DeviceState::Offline),
            resolved("c", DeviceState::Online),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].state, DeviceState::Online);
        assert_eq!(groups[0].device_ids(), vec!["a", "c"]);
        assert_eq!(groups[1].device_ids(), vec!["b"]);
    }

    #[test]
    fn test_not_active_guard_flags() {
        assert!(WriteOptions::for_target(DeviceState::Online).skip_if_not_active);
        assert!(WriteOptions::for_target(DeviceState::Offline).skip_if_not_active);
        assert!(!WriteOptions::for_target(DeviceState::NotActive).skip_if_not_active);
        assert!(WriteOptions::for_target(DeviceState::NotActive).suppress_change_events);
    }

    #[tokio::test]
    async fn test_one_write_per_group() {
        let repo = Arc::new(RecordingRepository::default());
        let outcomes = reconciler(repo.clone())
            .reconcile(vec![
                resolved("a", DeviceState::Online),
                resolved("b", DeviceState::Online),
                resolved("c", DeviceState::NotActive),
            ])
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(GroupOutcome::is_written));

        let mut writes = repo.writes.lock().unwrap().clone();
        writes.sort_by_key(|(_, state, _)| *state);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, vec!["a", "b"]);
        assert!(writes[0].2.skip_if_not_active);
        assert_eq!(writes[1].1, DeviceState::NotActive);
        assert!(!writes[1].2.skip_if_not_active);
    }

    #[tokio::test]
    async fn test_group_failure_does_not_block_siblings() {
        let repo = Arc::new(RecordingRepository {
            fail_state: Some((DeviceState::Offline, true)),
            ..Default::default()
        });
        let outcomes = reconciler(repo.clone())
            .reconcile(vec![
                resolved("a", DeviceState::Online),
                resolved("b", DeviceState::Offline),
            ])
            .await;

        assert!(outcomes[0].is_written());
        assert_eq!(outcomes[0].infos().len(), 1);
        assert!(outcomes[1].is_retryable());
        assert!(outcomes[1].infos().is_empty());
        assert_eq!(repo.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_classified() {
        let repo = Arc::new(RecordingRepository {
            fail_state: Some((DeviceState::Online, false)),
            ..Default::default()
        });
        let outcomes = reconciler(repo)
            .reconcile(vec![resolved("a", DeviceState::Online)])
            .await;

        assert!(matches!(
            outcomes[0].result,
            GroupResult::Failed {
                kind: FailureKind::NonRetryable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_slow_write_times_out_as_retryable() {
        struct Stalled;

        #[async_trait]
        impl DeviceRepository for Stalled {
            async fn bulk_set_state(&self, _: &[String], _: DeviceState, _: WriteOptions) -> Result<u64> {
                std::future::pending().await
            }
        }

        let reconciler = BulkReconciler::new(
            Arc::new(Stalled),
            RetryPolicy::default(),
            1,
            Duration::from_millis(20),
        );
        let outcomes = reconciler
            .reconcile(vec![resolved("a", DeviceState::Online)])
            .await;
        assert!(outcomes[0].is_retryable());
    }
}
