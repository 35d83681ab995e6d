//! Cycle-safe parent/child edits of the device hierarchy.
//!
//! Before a parent edge `(id, parent_id)` is written, [`CycleChecker`] walks
//! the ancestor chain of `parent_id` in the store:
//!
//! ```text
//! start ──► walking ──┬─► accept   reached a root, or a node already verified
//!                     └─► reject   reached `id` again, revisited any node,
//!                                  or visited more nodes than the store holds
//! ```
//!
//! The walk is an explicit loop with a visited set and a hard step cap equal
//! to the store's node count (plus the candidate itself), so inconsistent
//! data can never make it spin. Rejection happens before any write.
//!
//! # Example
//!
//! ```ignore
//! let service = HierarchyService::new(store);
//!
//! service.set_parent("sensor-1", "gateway-1").await?;
//! match service.set_parent("gateway-1", "sensor-1").await {
//!     Err(e) if e.is_rejection() => { /* surfaced to the caller */ }
//!     other => other?,
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::HierarchyEdge;

/// Parent/child relationships as stored by the registry.
#[async_trait]
pub trait HierarchyStore: Send + Sync {
    /// Current parent of `id`; `None` for roots and unknown devices.
    async fn parent_of(&self, id: &str) -> Result<Option<String>>;

    /// Total number of devices in the store.
    async fn node_count(&self) -> Result<usize>;

    async fn set_parent(&self, id: &str, parent_id: &str) -> Result<()>;

    async fn clear_parent(&self, id: &str) -> Result<()>;
}

/// Why a hierarchy edit was refused.
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("device {id} cannot be its own parent")]
    SelfParent { id: String },

    #[error("cyclic dependency: setting parent of {id} to {parent_id} closes the loop {}", .path.join(" -> "))]
    CyclicDependency {
        id: String,
        parent_id: String,
        /// `id`, `parent_id`, then each ancestor walked until the repeat.
        path: Vec<String>,
    },

    #[error("cyclic dependency: ancestor walk from {parent_id} exceeded {bound} nodes")]
    WalkBoundExceeded {
        id: String,
        parent_id: String,
        bound: usize,
    },

    #[error("hierarchy store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl HierarchyError {
    /// Validation rejection (as opposed to a store failure).
    pub fn is_rejection(&self) -> bool {
        !matches!(self, HierarchyError::Store(_))
    }
}

enum Walk {
    Walking { current: String },
    Accept,
    Reject(HierarchyError),
}

/// Bounded ancestor walk over a [`HierarchyStore`].
#[derive(Clone)]
pub struct CycleChecker {
    store: Arc<dyn HierarchyStore>,
}

impl CycleChecker {
    pub fn new(store: Arc<dyn HierarchyStore>) -> Self {
        Self { store }
    }

    /// Check a single candidate edge.
    pub async fn check(&self, edge: &HierarchyEdge) -> Result<(), HierarchyError> {
        self.check_with(edge, &HashMap::new(), &mut HashSet::new()).await
    }

    /// Check several edges as one change.
    ///
    /// Each edge is walked over the store with the earlier edges of the
    /// batch already applied, so candidates that only close a loop together
    /// are rejected. Verified ancestors are shared between walks.
    pub async fn check_all(&self, edges: &[HierarchyEdge]) -> Result<(), HierarchyError> {
        let mut pending: HashMap<String, Option<String>> = HashMap::new();
        let mut verified = HashSet::new();
        for edge in edges {
            self.check_with(edge, &pending, &mut verified).await?;
            pending.insert(edge.id.clone(), edge.parent_id.clone());
        }
        Ok(())
    }

    async fn parent_of(
        &self,
        id: &str,
        pending: &HashMap<String, Option<String>>,
    ) -> Result<Option<String>, HierarchyError> {
        match pending.get(id) {
            Some(parent) => Ok(parent.clone()),
            None => Ok(self.store.parent_of(id).await?),
        }
    }

    async fn check_with(
        &self,
        edge: &HierarchyEdge,
        pending: &HashMap<String, Option<String>>,
        verified: &mut HashSet<String>,
    ) -> Result<(), HierarchyError> {
        let id = edge.id.as_str();
        let Some(parent_id) = edge.parent_id.as_deref() else {
            return Ok(());
        };
        if parent_id == id {
            return Err(HierarchyError::SelfParent { id: id.to_string() });
        }

        let bound = self.store.node_count().await? + pending.len() + 1;
        // A verified chain may run through `id` itself; then it proves nothing.
        let shortcut = !verified.contains(id);
        let mut visited: HashSet<String> = HashSet::new();
        let mut path: SmallVec<[String; 8]> = SmallVec::new();
        path.push(id.to_string());
        path.push(parent_id.to_string());

        let mut state = Walk::Walking {
            current: parent_id.to_string(),
        };

        loop {
            state = match state {
                Walk::Walking { current } => {
                    if current == id {
                        Walk::Reject(HierarchyError::CyclicDependency {
                            id: id.to_string(),
                            parent_id: parent_id.to_string(),
                            path: path.to_vec(),
                        })
                    } else if shortcut && verified.contains(&current) {
                        Walk::Accept
                    } else if !visited.insert(current.clone()) {
                        warn!(device_id = %current, "pre-existing loop in device hierarchy");
                        Walk::Reject(HierarchyError::CyclicDependency {
                            id: id.to_string(),
                            parent_id: parent_id.to_string(),
                            path: path.to_vec(),
                        })
                    } else if visited.len() > bound {
                        Walk::Reject(HierarchyError::WalkBoundExceeded {
                            id: id.to_string(),
                            parent_id: parent_id.to_string(),
                            bound,
                        })
                    } else {
                        match self.parent_of(&current, pending).await? {
                            Some(next) => {
                                path.push(next.clone());
                                Walk::Walking { current: next }
                            }
                            None => Walk::Accept,
                        }
                    }
                }
                Walk::Accept => {
                    debug!(device_id = id, parent_id, depth = visited.len(), "parent edge accepted");
                    verified.extend(visited);
                    return Ok(());
                }
                Walk::Reject(err) => return Err(err),
            };
        }
    }
}

impl std::fmt::Debug for CycleChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleChecker").finish_non_exhaustive()
    }
}

/// Checked writes to the hierarchy.
///
/// Fresh registrations and rebinds go through the same path: check, then
/// write. A rejected edit performs no write.
#[derive(Clone)]
pub struct HierarchyService {
    store: Arc<dyn HierarchyStore>,
    checker: CycleChecker,
}

impl HierarchyService {
    pub fn new(store: Arc<dyn HierarchyStore>) -> Self {
        Self {
            checker: CycleChecker::new(store.clone()),
            store,
        }
    }

    pub fn checker(&self) -> &CycleChecker {
        &self.checker
    }

    /// Validate an edge without writing it.
    pub async fn check(&self, id: &str, parent_id: &str) -> Result<(), HierarchyError> {
        self.checker.check(&HierarchyEdge::child_of(id, parent_id)).await
    }

    pub async fn set_parent(&self, id: &str, parent_id: &str) -> Result<(), HierarchyError> {
        self.check(id, parent_id).await?;
        self.store.set_parent(id, parent_id).await?;
        info!(device_id = id, parent_id, "device parent set");
        Ok(())
    }

    pub async fn clear_parent(&self, id: &str) -> Result<(), HierarchyError> {
        self.store.clear_parent(id).await?;
        info!(device_id = id, "device parent cleared");
        Ok(())
    }

    /// Apply an edge: set the parent, or clear it for a root edge.
    pub async fn apply(&self, edge: &HierarchyEdge) -> Result<(), HierarchyError> {
        match edge.parent_id.as_deref() {
            Some(parent_id) => self.set_parent(&edge.id, parent_id).await,
            None => self.clear_parent(&edge.id).await,
        }
    }

    /// A gateway reported a child device.
    pub async fn bind_child(&self, gateway_id: &str, child_id: &str) -> Result<(), HierarchyError> {
        if gateway_id == child_id {
            return Err(HierarchyError::SelfParent {
                id: child_id.to_string(),
            });
        }
        self.set_parent(child_id, gateway_id).await
    }

    /// A gateway reported a child device went away.
    pub async fn unbind_child(&self, child_id: &str) -> Result<(), HierarchyError> {
        self.clear_parent(child_id).await
    }
}

impl std::fmt::Debug for HierarchyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyService").finish_non_exhaustive()
    }
}
