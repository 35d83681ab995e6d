//! Structured error types for the synchronizer.
//!
//! Collaborator traits (registry, repository, hierarchy store) return
//! `anyhow::Result`. The types here are the pattern-matchable errors this crate itself produces:
//!
//! - [`BufferError`] - durable queue failures
//! - [`ConfigError`] - rejected configuration
//! - [`QueryTimeout`] - marker for timed-out storage calls
//!
//! Hierarchy validation errors live next to the checker in
//! [`crate::hierarchy::HierarchyError`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the durable buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Underlying file system failure.
    #[error("buffer i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error("failed to encode buffered record: {0}")]
    Encode(#[from] serde_json::Error),

    /// A segment contains a damaged record that is not the torn tail.
    #[error("corrupt segment {path}: line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The pending record count reached `max_pending` under the shed policy.
    #[error("buffer is full ({max_pending} pending records)")]
    Full { max_pending: usize },

    /// The buffer has been closed.
    #[error("buffer is closed")]
    Closed,

    /// Another buffer instance in this process owns the directory.
    #[error("buffer directory {0} is already open")]
    InUse(PathBuf),
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("buffer name {0:?} must be a single non-empty path segment")]
    InvalidName(String),

    #[error("no topics configured for subscription {0:?}")]
    NoTopics(String),
}

/// A storage or lookup call did not complete in time.
///
/// Collaborators return this (inside an `anyhow::Error`) when their backend
/// reports a query timeout; the pipeline returns it when its own deadline
/// fires. The retry policy classifies it as a timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} timed out after {elapsed:?}")]
pub struct QueryTimeout {
    pub operation: String,
    pub elapsed: Duration,
}

impl QueryTimeout {
    pub fn new(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            operation: operation.into(),
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_error_display() {
        let err = BufferError::Full { max_pending: 10 };
        assert_eq!(err.to_string(), "buffer is full (10 pending records)");

        let err = BufferError::Corrupt {
            path: PathBuf::from("/tmp/q/1.seg"),
            line: 3,
            reason: "bad json".into(),
        };
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn test_query_timeout_survives_anyhow() {
        let err = anyhow::Error::from(QueryTimeout::new("bulk_set_state", Duration::from_secs(2)));
        let timeout = err.downcast_ref::<QueryTimeout>().unwrap();
        assert_eq!(timeout.operation, "bulk_set_state");
        assert!(err.to_string().contains("timed out"));
    }
}
