//! Primary error type for waitless operations.
//!
//! The concurrency cores deliberately keep their non-fatal failure surface
//! tiny: a deadlocked acquisition and commit-log plumbing are the only
//! recoverable conditions. Everything else (timestamp overflow, queue
//! invariant violations) is a programming error and asserts.

use std::path::PathBuf;

use thiserror::Error;
use waitless_types::{OwnerId, RecordId};

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, WaitlessError>;

/// Errors surfaced by the locking core and the harness plumbing around it.
#[derive(Error, Debug)]
pub enum WaitlessError {
    /// A wait-for cycle was detected while queueing a lock request.
    ///
    /// The transaction holding this error must abort and may retry.
    #[error("deadlock detected: owner {owner} waiting on record {record}")]
    Deadlock { owner: OwnerId, record: RecordId },

    /// Commit-log file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A commit-log line did not parse as `commit_id ids… values…`.
    #[error("malformed commit log line {line} in '{path}': {detail}")]
    LogParse {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    /// The replayed log count does not match the configured commit cap.
    #[error("commit log count mismatch: expected {expected}, found {actual}")]
    LogCountMismatch { expected: u64, actual: u64 },
}

impl WaitlessError {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Deadlocks are transient: abort, then run the transaction again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_is_transient() {
        let err = WaitlessError::Deadlock {
            owner: OwnerId::new(2),
            record: RecordId::new(7),
        };
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "deadlock detected: owner 2 waiting on record 7"
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: WaitlessError = io_err.into();
        assert!(matches!(err, WaitlessError::Io(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn log_count_mismatch_display() {
        let err = WaitlessError::LogCountMismatch {
            expected: 1000,
            actual: 998,
        };
        assert_eq!(
            err.to_string(),
            "commit log count mismatch: expected 1000, found 998"
        );
    }
}
