//! Core value types shared by every stage of the pipeline.
//!
//! - [`StateEvent`] = Fact (a device was seen going online/offline)
//! - [`CanonicalState`] = What the registry says right now
//! - [`DeviceState`] = What gets persisted
//!
//! Events are facts: they are immutable once taken from the bus and carry
//! only the device id and the time the transition was observed. The state
//! itself is never trusted from the event; it is always re-read from the
//! registry at flush time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw online/offline fact taken from the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    /// Device the transition belongs to.
    pub device_id: String,
    /// When the transition was observed by the producer.
    pub observed_at: DateTime<Utc>,
}

impl StateEvent {
    /// Create a new event.
    pub fn new(device_id: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            observed_at,
        }
    }

    /// Create an event observed now.
    pub fn now(device_id: impl Into<String>) -> Self {
        Self::new(device_id, Utc::now())
    }
}

/// A [`StateEvent`] as stored in the durable buffer.
///
/// `seq` is assigned on enqueue and increases monotonically for the
/// lifetime of the buffer directory, across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub event: StateEvent,
}

impl BufferedRecord {
    pub fn device_id(&self) -> &str {
        &self.event.device_id
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.event.observed_at
    }
}

/// Live device state as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalState {
    Online,
    Offline,
    NotActive,
    /// The registry could not tell.
    Unknown,
}

impl CanonicalState {
    /// Map to the persisted enumeration. `Unknown` is stored as `Offline`.
    pub fn to_persisted(self) -> DeviceState {
        match self {
            CanonicalState::Online => DeviceState::Online,
            CanonicalState::Offline | CanonicalState::Unknown => DeviceState::Offline,
            CanonicalState::NotActive => DeviceState::NotActive,
        }
    }
}

/// Persisted device state.
///
/// Ordering is only used to give reconciliation groups a stable write order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum DeviceState {
    Online,
    Offline,
    NotActive,
}

impl DeviceState {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Online => "online",
            DeviceState::Offline => "offline",
            DeviceState::NotActive => "notActive",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(DeviceState::Online),
            "offline" => Some(DeviceState::Offline),
            "notActive" => Some(DeviceState::NotActive),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CanonicalState> for DeviceState {
    fn from(state: CanonicalState) -> Self {
        state.to_persisted()
    }
}

/// A device whose canonical state has been looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub device_id: String,
    pub state: DeviceState,
    /// Whether the device aggregates child devices.
    pub is_gateway: bool,
}

/// Devices that share a target state within one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationGroup {
    pub state: DeviceState,
    pub devices: Vec<ResolvedDevice>,
}

impl ReconciliationGroup {
    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.device_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Result of synchronizing one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateInfo {
    pub device_id: String,
    pub state: DeviceState,
}

/// A parent/child relationship in the device graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HierarchyEdge {
    pub id: String,
    pub parent_id: Option<String>,
}

impl HierarchyEdge {
    pub fn root(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
        }
    }

    pub fn child_of(id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_maps_to_offline() {
        assert_eq!(CanonicalState::Unknown.to_persisted(), DeviceState::Offline);
        assert_eq!(CanonicalState::Offline.to_persisted(), DeviceState::Offline);
        assert_eq!(CanonicalState::Online.to_persisted(), DeviceState::Online);
        assert_eq!(
            CanonicalState::NotActive.to_persisted(),
            DeviceState::NotActive
        );
    }

    #[test]
    fn test_device_state_storage_names() {
        for state in [DeviceState::Online, DeviceState::Offline, DeviceState::NotActive] {
            assert_eq!(DeviceState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DeviceState::parse("bogus"), None);
        assert_eq!(
            serde_json::to_string(&DeviceState::NotActive).unwrap(),
            "\"notActive\""
        );
    }

    #[test]
    fn test_buffered_record_is_flat_on_disk() {
        let record = BufferedRecord {
            seq: 7,
            event: StateEvent::new("dev-1", DateTime::from_timestamp(0, 0).unwrap()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["device_id"], "dev-1");
        assert!(json.get("event").is_none());
    }
}
