//! Synchronizer configuration.
//!
//! Defaults mirror the production deployment of the device state
//! synchronizer: a 1000-record / 1 second flush window, a one hour TTL and
//! retries only for I/O errors and query timeouts.
//!
//! ```ignore
//! let config = SyncConfig::default()
//!     .with_storage_path("/var/lib/gateway/buffers")
//!     .with_batch_size(500)
//!     .with_ttl(Duration::from_secs(600));
//! config.validate()?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryableKind;

/// Default subscriber id, also the default buffer name.
pub const DEFAULT_NAME: &str = "device-state-synchronizer";

/// Topics that feed the state buffer.
pub const DEFAULT_TOPICS: [&str; 2] = ["/device/*/*/online", "/device/*/*/offline"];

/// What producers experience once `max_pending` records are buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// `enqueue` waits until a flush frees space.
    #[default]
    Block,
    /// `enqueue` fails with `BufferError::Full`.
    Shed,
}

/// Configuration for one synchronizer / buffer instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory for buffer directories.
    pub storage_path: PathBuf,
    /// Logical buffer name; the on-disk directory is `storage_path/name`.
    pub name: String,
    /// Subscriber id used on the bus.
    pub subscriber_id: String,
    /// Topic patterns feeding the buffer.
    pub topics: Vec<String>,
    /// Flush once this many records are pending.
    pub batch_size: usize,
    /// Flush once the oldest pending record has waited this long.
    #[serde(with = "millis")]
    pub flush_timeout: Duration,
    /// Records older than this at flush time are dropped.
    #[serde(with = "millis")]
    pub ttl: Duration,
    /// Failure kinds that keep a batch queued for the next flush.
    pub retryable: Vec<RetryableKind>,
    /// Backpressure threshold.
    pub max_pending: usize,
    pub overflow: OverflowPolicy,
    /// Concurrent registry lookups per flush.
    pub lookup_concurrency: usize,
    /// Concurrent group writes per flush.
    pub write_concurrency: usize,
    #[serde(with = "millis")]
    pub lookup_timeout: Duration,
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// Pause after a retryable flush failure.
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    /// Time allowed for the final flush on shutdown.
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
    /// Records per segment file before rolling over.
    pub segment_capacity: usize,
    /// `fsync` the segment after every append.
    pub sync_on_append: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data/device-state-buffer"),
            name: DEFAULT_NAME.to_string(),
            subscriber_id: DEFAULT_NAME.to_string(),
            topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            batch_size: 1000,
            flush_timeout: Duration::from_secs(1),
            ttl: Duration::from_secs(60 * 60),
            retryable: vec![RetryableKind::Io, RetryableKind::Timeout],
            max_pending: 100_000,
            overflow: OverflowPolicy::Block,
            lookup_concurrency: 32,
            write_concurrency: 4,
            lookup_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
            segment_capacity: 10_000,
            sync_on_append: false,
        }
    }
}

impl SyncConfig {
    /// Directory holding this buffer's segments and checkpoint.
    pub fn buffer_dir(&self) -> PathBuf {
        self.storage_path.join(&self.name)
    }

    pub fn with_storage_path(mut self, path: impl AsRef<Path>) -> Self {
        self.storage_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_subscriber_id(mut self, id: impl Into<String>) -> Self {
        self.subscriber_id = id.into();
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = RetryableKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize, overflow: OverflowPolicy) -> Self {
        self.max_pending = max_pending;
        self.overflow = overflow;
        self
    }

    pub fn with_lookup_concurrency(mut self, n: usize) -> Self {
        self.lookup_concurrency = n;
        self
    }

    pub fn with_write_concurrency(mut self, n: usize) -> Self {
        self.write_concurrency = n;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_segment_capacity(mut self, records: usize) -> Self {
        self.segment_capacity = records;
        self
    }

    pub fn with_sync_on_append(mut self, sync: bool) -> Self {
        self.sync_on_append = sync;
        self
    }

    /// Check the configuration before opening a buffer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("batch_size", self.batch_size),
            ("max_pending", self.max_pending),
            ("lookup_concurrency", self.lookup_concurrency),
            ("write_concurrency", self.write_concurrency),
            ("segment_capacity", self.segment_capacity),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        let durations = [
            ("flush_timeout", self.flush_timeout),
            ("ttl", self.ttl),
            ("lookup_timeout", self.lookup_timeout),
            ("write_timeout", self.write_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }

        let name_ok = !self.name.is_empty()
            && self.name != "."
            && self.name != ".."
            && !self.name.contains(['/', '\\']);
        if !name_ok {
            return Err(ConfigError::InvalidName(self.name.clone()));
        }

        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics(self.subscriber_id.clone()));
        }

        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.ttl, Duration::from_secs(3600));
        assert_eq!(
            config.buffer_dir(),
            PathBuf::from("./data/device-state-buffer/device-state-synchronizer")
        );
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = SyncConfig::default().with_batch_size(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "batch_size"
            })
        );

        let config = SyncConfig::default().with_ttl(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::Zero { field: "ttl" }));
    }

    #[test]
    fn test_name_must_be_one_segment() {
        for bad in ["", "..", "a/b", "a\\b"] {
            let config = SyncConfig::default().with_name(bad);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_deserialize_with_millis_and_defaults() {
        let config: SyncConfig = serde_json::from_value(serde_json::json!({
            "name": "edge-buffer",
            "batch_size": 10,
            "flush_timeout": 250,
            "retryable": ["io"],
            "overflow": "shed"
        }))
        .unwrap();

        assert_eq!(config.name, "edge-buffer");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.flush_timeout, Duration::from_millis(250));
        assert_eq!(config.retryable, vec![RetryableKind::Io]);
        assert_eq!(config.overflow, OverflowPolicy::Shed);
        assert_eq!(config.ttl, Duration::from_secs(3600));
    }
}
