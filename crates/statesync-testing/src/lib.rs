//! In-memory collaborators for testing statesync pipelines.
//!
//! Each fake records what was asked of it and can be told to fail, so tests
//! can drive the fallback and retry paths without a database.
//!
//! # Quick Start
//!
//! ```ignore
//! use statesync_testing::{Failure, InMemoryRegistry, InMemoryRepository};
//!
//! let registry = InMemoryRegistry::new();
//! registry.set_state("dev-1", CanonicalState::Online);
//!
//! let repository = InMemoryRepository::new();
//! repository.seed("dev-1", DeviceState::Offline);
//! repository.fail_next(Failure::Io);
//!
//! // ... run a flush: it comes back as Retry, the batch stays queued ...
//!
//! assert_eq!(repository.state_of("dev-1"), Some(DeviceState::Online));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use statesync::{
    CanonicalState, CanonicalStateSource, DeviceRepository, DeviceState, HierarchyStore,
    QueryTimeout, WriteOptions,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A failure a fake can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// `std::io::Error`, e.g. a dropped connection.
    Io,
    /// [`QueryTimeout`].
    Timeout,
    /// Anything else, e.g. a constraint violation.
    Permanent,
}

impl Failure {
    pub fn into_error(self, operation: &str) -> anyhow::Error {
        match self {
            Failure::Io => std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("{operation}: connection reset by peer"),
            )
            .into(),
            Failure::Timeout => QueryTimeout::new(operation, Duration::ZERO).into(),
            Failure::Permanent => {
                anyhow::anyhow!("{operation}: violates check constraint \"device_state_check\"")
            }
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    states: HashMap<String, CanonicalState>,
    probed: HashMap<String, CanonicalState>,
    gateways: HashSet<String>,
    failing: HashMap<String, Failure>,
    delay: Option<Duration>,
}

/// A device registry held in memory.
///
/// Devices that were never given a state are reported as not registered.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<RegistryState>>,
    lookups: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, device_id: impl Into<String>, state: CanonicalState) {
        lock(&self.state).states.insert(device_id.into(), state);
    }

    /// State returned by an active probe; defaults to the cached state.
    pub fn set_probed_state(&self, device_id: impl Into<String>, state: CanonicalState) {
        lock(&self.state).probed.insert(device_id.into(), state);
    }

    pub fn set_gateway(&self, device_id: impl Into<String>) {
        lock(&self.state).gateways.insert(device_id.into());
    }

    /// Remove a device, as if it was deleted from the registry.
    pub fn unregister(&self, device_id: &str) {
        let mut state = lock(&self.state);
        state.states.remove(device_id);
        state.probed.remove(device_id);
        state.gateways.remove(device_id);
    }

    /// Every lookup for `device_id` fails until [`clear_failures`](Self::clear_failures).
    pub fn fail_lookups_for(&self, device_id: impl Into<String>, failure: Failure) {
        lock(&self.state).failing.insert(device_id.into(), failure);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failing.clear();
    }

    /// Delay every lookup, e.g. to exercise lookup timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        lock(&self.state).delay = delay;
    }

    /// Number of `state` lookups served.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Acquire)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::Acquire)
    }

    async fn pause(&self) {
        let delay = lock(&self.state).delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_failure(&self, device_id: &str, operation: &str) -> Result<()> {
        match lock(&self.state).failing.get(device_id) {
            Some(failure) => Err(failure.into_error(operation)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CanonicalStateSource for InMemoryRegistry {
    async fn state(&self, device_id: &str) -> Result<Option<CanonicalState>> {
        self.lookups.fetch_add(1, Ordering::AcqRel);
        self.pause().await;
        self.check_failure(device_id, "state")?;
        Ok(lock(&self.state).states.get(device_id).copied())
    }

    async fn check_state(&self, device_id: &str) -> Result<Option<CanonicalState>> {
        self.probes.fetch_add(1, Ordering::AcqRel);
        self.pause().await;
        self.check_failure(device_id, "check_state")?;
        let state = lock(&self.state);
        Ok(state
            .probed
            .get(device_id)
            .or_else(|| state.states.get(device_id))
            .copied())
    }

    async fn is_gateway(&self, device_id: &str) -> Result<bool> {
        self.pause().await;
        self.check_failure(device_id, "is_gateway")?;
        Ok(lock(&self.state).gateways.contains(device_id))
    }
}

/// One `bulk_set_state` call as the repository saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub ids: Vec<String>,
    pub state: DeviceState,
    pub options: WriteOptions,
    /// Rows actually changed.
    pub rows: u64,
}

#[derive(Debug, Default)]
struct RepositoryState {
    devices: HashMap<String, DeviceState>,
    writes: Vec<RecordedWrite>,
    failures: VecDeque<(Option<DeviceState>, Failure)>,
    change_events: usize,
}

/// A device table held in memory.
///
/// Only seeded devices exist; writes for unknown ids match no rows, like an
/// `UPDATE ... WHERE id = ANY(..)` would.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<RepositoryState>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, device_id: impl Into<String>, state: DeviceState) {
        lock(&self.state).devices.insert(device_id.into(), state);
    }

    pub fn state_of(&self, device_id: &str) -> Option<DeviceState> {
        lock(&self.state).devices.get(device_id).copied()
    }

    /// The next write (for any state) fails with `failure`.
    pub fn fail_next(&self, failure: Failure) {
        lock(&self.state).failures.push_back((None, failure));
    }

    /// The next write for `state` fails with `failure`.
    pub fn fail_next_for(&self, state: DeviceState, failure: Failure) {
        lock(&self.state).failures.push_back((Some(state), failure));
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.state).writes.len()
    }

    /// Writes for one target state.
    pub fn writes_for(&self, state: DeviceState) -> Vec<RecordedWrite> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|w| w.state == state)
            .cloned()
            .collect()
    }

    /// Change events that writes without suppression would have emitted.
    pub fn change_events(&self) -> usize {
        lock(&self.state).change_events
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// Panics unless exactly one write targeted `state`.
    pub fn assert_single_write_for(&self, state: DeviceState) {
        let writes = self.writes_for(state);
        assert_eq!(
            writes.len(),
            1,
            "expected one write for {state}, got {}: {writes:?}",
            writes.len()
        );
    }
}

#[async_trait]
impl DeviceRepository for InMemoryRepository {
    async fn bulk_set_state(
        &self,
        ids: &[String],
        state: DeviceState,
        options: WriteOptions,
    ) -> Result<u64> {
        let mut inner = lock(&self.state);

        let failing = inner
            .failures
            .iter()
            .position(|(target, _)| target.map_or(true, |t| t == state));
        if let Some(index) = failing {
            if let Some((_, failure)) = inner.failures.remove(index) {
                return Err(failure.into_error("bulk_set_state"));
            }
        }

        let mut rows = 0;
        for id in ids {
            let Some(current) = inner.devices.get_mut(id) else {
                continue;
            };
            if options.skip_if_not_active && *current == DeviceState::NotActive {
                continue;
            }
            *current = state;
            rows += 1;
        }

        if !options.suppress_change_events {
            inner.change_events += rows as usize;
        }
        inner.writes.push(RecordedWrite {
            ids: ids.to_vec(),
            state,
            options,
            rows,
        });
        Ok(rows)
    }
}

#[derive(Debug, Default)]
struct HierarchyState {
    parents: HashMap<String, Option<String>>,
    writes: usize,
    failure: Option<Failure>,
}

/// A device hierarchy held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHierarchy {
    state: Arc<Mutex<HierarchyState>>,
}

impl InMemoryHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(id, parent)` pairs.
    pub fn with_edges<'a>(edges: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        let hierarchy = Self::new();
        {
            let mut state = lock(&hierarchy.state);
            for (id, parent) in edges {
                state
                    .parents
                    .insert(id.to_string(), parent.map(str::to_string));
            }
        }
        hierarchy
    }

    pub fn parent(&self, id: &str) -> Option<String> {
        lock(&self.state).parents.get(id).cloned().flatten()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.state).parents.contains_key(id)
    }

    /// Number of `set_parent`/`clear_parent` calls that reached the store.
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    /// Every store call fails with `failure` until cleared with `None`.
    pub fn set_failure(&self, failure: Option<Failure>) {
        lock(&self.state).failure = failure;
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        match lock(&self.state).failure {
            Some(failure) => Err(failure.into_error(operation)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HierarchyStore for InMemoryHierarchy {
    async fn parent_of(&self, id: &str) -> Result<Option<String>> {
        self.check_failure("parent_of")?;
        Ok(self.parent(id))
    }

    async fn node_count(&self) -> Result<usize> {
        self.check_failure("node_count")?;
        Ok(lock(&self.state).parents.len())
    }

    async fn set_parent(&self, id: &str, parent_id: &str) -> Result<()> {
        self.check_failure("set_parent")?;
        let mut state = lock(&self.state);
        state
            .parents
            .insert(id.to_string(), Some(parent_id.to_string()));
        state.writes += 1;
        Ok(())
    }

    async fn clear_parent(&self, id: &str) -> Result<()> {
        self.check_failure("clear_parent")?;
        let mut state = lock(&self.state);
        if let Some(parent) = state.parents.get_mut(id) {
            *parent = None;
        }
        state.writes += 1;
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await.is_ok()
}

/// Await `future`, failing with a message if it takes longer than `timeout`.
pub async fn within<F: Future>(timeout: Duration, future: F) -> F::Output {
    match tokio::time::timeout(timeout, future).await {
        Ok(output) => output,
        Err(_) => panic!("operation did not finish within {timeout:?}"),
    }
}
