//! Canonical state lookup for deduplicated devices.
//!
//! A failed lookup never fails the batch. The fallbacks are:
//!
//! | Situation | Resolved state | Gateway flag |
//! |-----------|----------------|--------------|
//! | registry error or timeout | `Offline` | `false` |
//! | registry reports `Unknown` | `Offline` | as reported |
//! | device not registered | `NotActive` | `false` |
//!
//! Lookups for one flush run concurrently, bounded by
//! `lookup_concurrency`, and results come back in input order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::core::{CanonicalState, DeviceState, ResolvedDevice};
use crate::error::QueryTimeout;

/// The live device registry.
///
/// `Ok(None)` means the registry does not know the device.
#[async_trait]
pub trait CanonicalStateSource: Send + Sync {
    /// Last known state held by the registry.
    async fn state(&self, device_id: &str) -> Result<Option<CanonicalState>>;

    /// Actively probe the device. Defaults to [`state`](Self::state).
    async fn check_state(&self, device_id: &str) -> Result<Option<CanonicalState>> {
        self.state(device_id).await
    }

    /// Whether the device is a gateway that aggregates children.
    async fn is_gateway(&self, device_id: &str) -> Result<bool>;
}

/// Resolves device ids to persisted states with fallbacks.
#[derive(Clone)]
pub struct StateResolver {
    source: Arc<dyn CanonicalStateSource>,
    concurrency: usize,
    timeout: Duration,
}

impl StateResolver {
    pub fn new(source: Arc<dyn CanonicalStateSource>, concurrency: usize, timeout: Duration) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    /// Resolve every id, preserving input order.
    ///
    /// With `force` the registry is asked to probe each device; a failed
    /// probe falls back to the cached state.
    pub async fn resolve_all(&self, device_ids: Vec<String>, force: bool) -> Vec<ResolvedDevice> {
        stream::iter(device_ids)
            .map(|id| self.resolve_one(id, force))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    pub async fn resolve_one(&self, device_id: String, force: bool) -> ResolvedDevice {
        let (state, is_gateway) = futures::join!(
            self.lookup_state(&device_id, force),
            self.lookup_gateway(&device_id)
        );
        ResolvedDevice {
            device_id,
            state,
            is_gateway,
        }
    }

    async fn lookup_state(&self, device_id: &str, force: bool) -> DeviceState {
        let looked_up = if force {
            match self.bounded("check_state", self.source.check_state(device_id)).await {
                Ok(state) => Ok(state),
                Err(e) => {
                    warn!(device_id, error = %e, "state probe failed, using cached state");
                    self.bounded("state", self.source.state(device_id)).await
                }
            }
        } else {
            self.bounded("state", self.source.state(device_id)).await
        };

        match looked_up {
            Ok(Some(state)) => state.to_persisted(),
            Ok(None) => DeviceState::NotActive,
            Err(e) => {
                warn!(device_id, error = %e, "state lookup failed, resolving to offline");
                DeviceState::Offline
            }
        }
    }

    async fn lookup_gateway(&self, device_id: &str) -> bool {
        match self.bounded("is_gateway", self.source.is_gateway(device_id)).await {
            Ok(flag) => flag,
            Err(e) => {
                warn!(device_id, error = %e, "gateway flag lookup failed, assuming false");
                false
            }
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QueryTimeout::new(operation, self.timeout).into()),
        }
    }
}

impl std::fmt::Debug for StateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateResolver")
            .field("concurrency", &self.concurrency)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubRegistry {
        states: HashMap<String, CanonicalState>,
        gateways: Vec<String>,
        failing: Vec<String>,
        probe_fails: bool,
        hang: Vec<String>,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl CanonicalStateSource for StubRegistry {
        async fn state(&self, device_id: &str) -> Result<Option<CanonicalState>> {
            if self.hang.iter().any(|id| id == device_id) {
                std::future::pending::<()>().await;
            }
            if self.failing.iter().any(|id| id == device_id) {
                anyhow::bail!("registry unavailable");
            }
            Ok(self.states.get(device_id).copied())
        }

        async fn check_state(&self, device_id: &str) -> Result<Option<CanonicalState>> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_fails {
                anyhow::bail!("probe timed out");
            }
            Ok(Some(CanonicalState::Online))
        }

        async fn is_gateway(&self, device_id: &str) -> Result<bool> {
            if self.failing.iter().any(|id| id == device_id) {
                anyhow::bail!("registry unavailable");
            }
            Ok(self.gateways.iter().any(|id| id == device_id))
        }
    }

    fn resolver(registry: StubRegistry) -> StateResolver {
        StateResolver::new(Arc::new(registry), 4, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_resolves_known_devices_in_order() {
        let mut registry = StubRegistry::default();
        registry.states.insert("a".into(), CanonicalState::Online);
        registry.states.insert("b".into(), CanonicalState::Unknown);
        registry.gateways.push("a".into());

        let resolved = resolver(registry)
            .resolve_all(vec!["a".into(), "b".into()], false)
            .await;

        assert_eq!(
            resolved,
            vec![
                ResolvedDevice {
                    device_id: "a".into(),
                    state: DeviceState::Online,
                    is_gateway: true,
                },
                ResolvedDevice {
                    device_id: "b".into(),
                    state: DeviceState::Offline,
                    is_gateway: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_lookup_failure_resolves_offline() {
        let mut registry = StubRegistry::default();
        registry.failing.push("x".into());

        let resolved = resolver(registry).resolve_one("x".into(), false).await;
        assert_eq!(resolved.state, DeviceState::Offline);
        assert!(!resolved.is_gateway);
    }

    #[tokio::test]
    async fn test_lookup_timeout_resolves_offline() {
        let mut registry = StubRegistry::default();
        registry.hang.push("slow".into());

        let resolved = resolver(registry).resolve_one("slow".into(), false).await;
        assert_eq!(resolved.state, DeviceState::Offline);
    }

    #[tokio::test]
    async fn test_unregistered_device_resolves_not_active() {
        let resolved = resolver(StubRegistry::default())
            .resolve_one("ghost".into(), false)
            .await;
        assert_eq!(resolved.state, DeviceState::NotActive);
    }

    #[tokio::test]
    async fn test_force_probes_and_falls_back_to_cached_state() {
        let mut registry = StubRegistry::default();
        registry.states.insert("a".into(), CanonicalState::Offline);
        let resolved = resolver(registry).resolve_one("a".into(), true).await;
        assert_eq!(resolved.state, DeviceState::Online);

        let mut registry = StubRegistry::default();
        registry.states.insert("a".into(), CanonicalState::Offline);
        registry.probe_fails = true;
        let registry = Arc::new(registry);
        let resolver = StateResolver::new(registry.clone(), 1, Duration::from_millis(50));
        let resolved = resolver.resolve_one("a".into(), true).await;
        assert_eq!(resolved.state, DeviceState::Offline);
        assert_eq!(registry.probes.load(Ordering::SeqCst), 1);
    }
}
