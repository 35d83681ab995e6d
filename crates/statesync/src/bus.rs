//! In-process topic bus for device messages.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss messages
//! - **In-memory only**: nothing is persisted until a handler buffers it
//! - **No replay**: lagged receivers get `RecvError::Lagged`
//!
//! Every message carries its topic, e.g. `/device/{product}/{device}/online`,
//! and whether it originated on this node (`local`). Subscribers filter with
//! [`TopicPattern`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::StateEvent;

/// Default channel capacity for the bus.
const DEFAULT_CAPACITY: usize = 10000;

/// What a device reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceMessageKind {
    Online,
    Offline,
    /// A gateway registered a child device.
    ChildRegister { child_id: String },
    /// A gateway unregistered a child device.
    ChildUnregister { child_id: String },
}

/// A message from a device, as routed on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    pub product_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DeviceMessageKind,
}

impl DeviceMessage {
    pub fn online(product_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::now(product_id, device_id, DeviceMessageKind::Online)
    }

    pub fn offline(product_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::now(product_id, device_id, DeviceMessageKind::Offline)
    }

    pub fn child_register(
        product_id: impl Into<String>,
        gateway_id: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self::now(
            product_id,
            gateway_id,
            DeviceMessageKind::ChildRegister {
                child_id: child_id.into(),
            },
        )
    }

    pub fn child_unregister(
        product_id: impl Into<String>,
        gateway_id: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self::now(
            product_id,
            gateway_id,
            DeviceMessageKind::ChildUnregister {
                child_id: child_id.into(),
            },
        )
    }

    fn now(product_id: impl Into<String>, device_id: impl Into<String>, kind: DeviceMessageKind) -> Self {
        Self {
            product_id: product_id.into(),
            device_id: device_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Topic this message is published under.
    pub fn topic(&self) -> String {
        let base = format!("/device/{}/{}", self.product_id, self.device_id);
        match &self.kind {
            DeviceMessageKind::Online => format!("{base}/online"),
            DeviceMessageKind::Offline => format!("{base}/offline"),
            DeviceMessageKind::ChildRegister { child_id } => {
                format!("{base}/message/children/{child_id}/register")
            }
            DeviceMessageKind::ChildUnregister { child_id } => {
                format!("{base}/message/children/{child_id}/unregister")
            }
        }
    }

    /// The state event carried by an online/offline message.
    pub fn state_event(&self) -> Option<StateEvent> {
        match self.kind {
            DeviceMessageKind::Online | DeviceMessageKind::Offline => {
                Some(StateEvent::new(self.device_id.clone(), self.timestamp))
            }
            _ => None,
        }
    }
}

/// A message together with its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub message: DeviceMessage,
    /// Published on this node rather than forwarded from a peer.
    pub local: bool,
}

/// Broadcast bus for [`BusMessage`]s.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new();
/// let mut receiver = bus.subscribe();
///
/// bus.publish(DeviceMessage::online("thermostat", "device-1"));
///
/// let message = receiver.recv().await?;
/// assert_eq!(message.topic, "/device/thermostat/device-1/online");
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// The capacity determines how many messages can be buffered before
    /// slow receivers start lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a message originating on this node.
    ///
    /// Returns the number of receivers that got it.
    pub fn publish(&self, message: DeviceMessage) -> usize {
        self.send(message, true)
    }

    /// Publish a message forwarded from another node.
    pub fn publish_remote(&self, message: DeviceMessage) -> usize {
        self.send(message, false)
    }

    fn send(&self, message: DeviceMessage, local: bool) -> usize {
        let topic = message.topic();
        self.sender
            .send(BusMessage {
                topic,
                message,
                local,
            })
            .unwrap_or(0)
    }

    /// Receive every message published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment.
    Any,
    /// `**`: zero or more trailing segments.
    Rest,
}

/// A `/`-separated topic filter.
///
/// `*` matches exactly one segment; a trailing `**` matches the rest of the
/// topic, including nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

/// Rejected topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid topic pattern {pattern:?}: {reason}")]
pub struct InvalidTopicPattern {
    pub pattern: String,
    pub reason: &'static str,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, InvalidTopicPattern> {
        let invalid = |reason| InvalidTopicPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let parts: Vec<&str> = split(pattern).collect();
        if parts.is_empty() {
            return Err(invalid("no segments"));
        }

        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => return Err(invalid("empty segment")),
                "*" => Segment::Any,
                "**" if i + 1 == parts.len() => Segment::Rest,
                "**" => return Err(invalid("'**' is only allowed last")),
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = split(topic);
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Any => match parts.next() {
                    Some(part) if !part.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(literal) => {
                    if parts.next() != Some(literal.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

fn split(topic: &str) -> impl Iterator<Item = &str> {
    topic.strip_prefix('/').unwrap_or(topic).split('/')
}

impl FromStr for TopicPattern {
    type Err = InvalidTopicPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_for_each_kind() {
        assert_eq!(
            DeviceMessage::online("p", "d").topic(),
            "/device/p/d/online"
        );
        assert_eq!(
            DeviceMessage::offline("p", "d").topic(),
            "/device/p/d/offline"
        );
        assert_eq!(
            DeviceMessage::child_register("p", "gw", "c").topic(),
            "/device/p/gw/message/children/c/register"
        );
        assert_eq!(
            DeviceMessage::child_unregister("p", "gw", "c").topic(),
            "/device/p/gw/message/children/c/unregister"
        );
    }

    #[test]
    fn test_state_event_only_for_online_offline() {
        let message = DeviceMessage::offline("p", "d");
        let event = message.state_event().unwrap();
        assert_eq!(event.device_id, "d");
        assert_eq!(event.observed_at, message.timestamp);
        assert!(DeviceMessage::child_register("p", "gw", "c")
            .state_event()
            .is_none());
    }

    #[test]
    fn test_single_segment_wildcard() {
        let pattern = TopicPattern::parse("/device/*/*/online").unwrap();
        assert!(pattern.matches("/device/p/d/online"));
        assert!(!pattern.matches("/device/p/d/offline"));
        assert!(!pattern.matches("/device/p/online"));
        assert!(!pattern.matches("/device/p/d/online/extra"));
        assert!(!pattern.matches("/device//d/online"));
    }

    #[test]
    fn test_trailing_rest_wildcard() {
        let pattern = TopicPattern::parse("/device/p/**").unwrap();
        assert!(pattern.matches("/device/p"));
        assert!(pattern.matches("/device/p/d/online"));
        assert!(!pattern.matches("/device/q/d/online"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TopicPattern::parse("device/*").is_err());
        assert!(TopicPattern::parse("/device//online").is_err());
        assert!(TopicPattern::parse("/**/online").is_err());
        assert_eq!(
            "/device/*/*/offline".parse::<TopicPattern>().unwrap().to_string(),
            "/device/*/*/offline"
        );
    }

    #[tokio::test]
    async fn test_publish_marks_locality() {
        let bus = EventBus::with_capacity(8);
        let mut receiver = bus.subscribe();

        assert_eq!(bus.publish(DeviceMessage::online("p", "a")), 1);
        bus.publish_remote(DeviceMessage::online("p", "b"));

        let first = receiver.recv().await.unwrap();
        assert!(first.local);
        assert_eq!(first.topic, "/device/p/a/online");
        let second = receiver.recv().await.unwrap();
        assert!(!second.local);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_returns_zero() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(DeviceMessage::online("p", "a")), 0);
        assert!(format!("{bus:?}").contains("subscriber_count"));
    }
}
