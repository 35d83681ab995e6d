//! Failure classification for flush writes.
//!
//! A flush either keeps its batch queued (retryable failure, the next
//! scheduled flush picks the same records up again) or drops it
//! (non-retryable failure, logged at error level). Which failures count as
//! retryable is configurable; the default set is I/O errors and query
//! timeouts.
//!
//! Classification walks the whole `anyhow` chain, so collaborators may add
//! context freely:
//!
//! ```ignore
//! let err = anyhow::Error::from(io_err).context("bulk update failed");
//! assert_eq!(policy.classify(&err), FailureKind::Retryable);
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;

use crate::error::QueryTimeout;

/// Classification of a flush failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The batch stays queued and is retried on the next flush.
    ///
    /// Examples: connection reset, query timeout
    Retryable,

    /// The batch is dropped.
    ///
    /// Examples: constraint violation, malformed query, unknown column
    NonRetryable,
}

/// Failure families that can be configured as retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableKind {
    /// A `std::io::Error` anywhere in the chain.
    Io,
    /// A [`QueryTimeout`] or `tokio::time::error::Elapsed` in the chain.
    Timeout,
}

impl fmt::Display for RetryableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryableKind::Io => write!(f, "io"),
            RetryableKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Decides whether a failed write should be retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retryable: HashSet<RetryableKind>,
}

impl RetryPolicy {
    pub fn new(retryable: impl IntoIterator<Item = RetryableKind>) -> Self {
        Self {
            retryable: retryable.into_iter().collect(),
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            retryable: HashSet::new(),
        }
    }

    /// Failure families found along the error chain, outermost first.
    pub fn kinds_of(error: &anyhow::Error) -> impl Iterator<Item = RetryableKind> + '_ {
        error.chain().filter_map(|cause| {
            if cause.is::<std::io::Error>() {
                Some(RetryableKind::Io)
            } else if cause.is::<QueryTimeout>() || cause.is::<tokio::time::error::Elapsed>() {
                Some(RetryableKind::Timeout)
            } else {
                None
            }
        })
    }

    /// The outermost failure family of an error, if it has one.
    pub fn kind_of(error: &anyhow::Error) -> Option<RetryableKind> {
        Self::kinds_of(error).next()
    }

    /// Retryable when any cause in the chain belongs to a configured family.
    pub fn classify(&self, error: &anyhow::Error) -> FailureKind {
        if Self::kinds_of(error).any(|kind| self.retryable.contains(&kind)) {
            FailureKind::Retryable
        } else {
            FailureKind::NonRetryable
        }
    }

    pub fn is_retryable(&self, kind: RetryableKind) -> bool {
        self.retryable.contains(&kind)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new([RetryableKind::Io, RetryableKind::Timeout])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn io_error() -> anyhow::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer").into()
    }

    #[test]
    fn test_io_error_is_retryable() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.classify(&io_error()), FailureKind::Retryable);
    }

    #[test]
    fn test_context_does_not_hide_cause() {
        let policy = RetryPolicy::default();
        let err = io_error().context("bulk update of 12 devices failed");
        assert_eq!(policy.classify(&err), FailureKind::Retryable);
    }

    #[test]
    fn test_timeouts_are_retryable() {
        let policy = RetryPolicy::default();
        let err = anyhow::Error::from(QueryTimeout::new("bulk_set_state", Duration::from_secs(1)));
        assert_eq!(policy.classify(&err), FailureKind::Retryable);
    }

    #[tokio::test]
    async fn test_elapsed_is_a_timeout() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        let err = anyhow::Error::from(elapsed);
        assert_eq!(RetryPolicy::kind_of(&err), Some(RetryableKind::Timeout));
    }

    #[test]
    fn test_other_errors_are_permanent() {
        let policy = RetryPolicy::default();
        let err = anyhow::anyhow!("violates check constraint \"device_state_check\"");
        assert_eq!(policy.classify(&err), FailureKind::NonRetryable);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("statement cancelled")]
    struct Cancelled(#[source] QueryTimeout);

    #[test]
    fn test_retryable_cause_below_other_family_counts() {
        // io::Error delegates `source()` to its payload, so the chain is
        // io::Error -> QueryTimeout.
        let timeout = QueryTimeout::new("bulk_set_state", Duration::from_secs(1));
        let err = anyhow::Error::from(std::io::Error::other(Cancelled(timeout)));

        let kinds: Vec<_> = RetryPolicy::kinds_of(&err).collect();
        assert_eq!(kinds, vec![RetryableKind::Io, RetryableKind::Timeout]);

        let policy = RetryPolicy::new([RetryableKind::Timeout]);
        assert_eq!(policy.classify(&err), FailureKind::Retryable);
        assert_eq!(RetryPolicy::never().classify(&err), FailureKind::NonRetryable);
    }

    #[test]
    fn test_configured_set_is_respected() {
        let policy = RetryPolicy::new([RetryableKind::Timeout]);
        assert_eq!(policy.classify(&io_error()), FailureKind::NonRetryable);
        assert!(policy.is_retryable(RetryableKind::Timeout));

        assert_eq!(RetryPolicy::never().classify(&io_error()), FailureKind::NonRetryable);
    }
}
