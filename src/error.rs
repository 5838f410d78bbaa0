// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for catalog sync.
//!
//! Errors are grouped by how a scheduled run should react to them. Every
//! variant is fatal for the current invocation except per-record validation
//! failures during replay, which never surface here: the replay engine logs
//! them to the side error log and continues (see [`crate::replay`]).
//!
//! # Error Categories
//!
//! | Error Type | Category | Description |
//! |------------|----------|-------------|
//! | `Config` | Configuration | Missing endpoint or credentials |
//! | `InvalidArgument` | Configuration | Missing cursor, bad bucket id |
//! | `Protocol` | Protocol | Malformed control filename or body |
//! | `SizeMismatch` | Protocol | Artifact size differs from control file |
//! | `ChecksumMismatch` | Protocol | Artifact checksum differs from control file |
//! | `Decompression` | Protocol | Artifact passed integrity checks but is not valid gzip |
//! | `LockContention` | LockContention | Another process holds the artifact lock |
//! | `MissingPostState` | Replay | No post-event snapshot for a create/update |
//! | `ReplayFailed` | Replay | Replay stopped; carries the resume point |
//! | `Store` | Replay | Destination or source store failure |
//! | `Io`, `Serialization`, `Transport`, `History`, `Internal` | Other | Environment failures |
//!
//! A failed run never advances a control file, so the next scheduled run
//! retries the same bucket.

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification used for notifications and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Protocol,
    Replay,
    LockContention,
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Replay => write!(f, "replay"),
            ErrorCategory::LockContention => write!(f, "lock_contention"),
            ErrorCategory::Other => write!(f, "other"),
        }
    }
}

/// Errors that can occur while exporting, packaging, transporting or replaying.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or missing configuration.
    ///
    /// Raised before any file is touched. Fix the configuration and rerun.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required argument was absent or malformed (e.g. no export cursor).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Control file or bucket layout violates the transfer protocol.
    ///
    /// The discovery scan stops at the first malformed entry.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Compressed artifact size differs from the size recorded in the control file.
    #[error("Unmatched file size for {control}: control file says {expected}, artifact is {actual} bytes")]
    SizeMismatch {
        control: String,
        expected: u64,
        actual: u64,
    },

    /// Compressed artifact checksum differs from the checksum in the control file.
    #[error("Unmatched checksum for {control}: control file says {expected}, artifact hashes to {actual}")]
    ChecksumMismatch {
        control: String,
        expected: String,
        actual: String,
    },

    /// Gzip decoding failed after integrity checks passed.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Another process holds the exclusive lock on an artifact file.
    #[error("Another process is writing to {path}")]
    LockContention { path: String },

    /// Filesystem failure.
    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Payload or result file (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote endpoint failure. Never retried within a run.
    #[error("Transport error ({operation}): {message}")]
    Transport { operation: String, message: String },

    /// Source or destination store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A create/update event has no post-event snapshot to apply.
    #[error("No post-event state for \"{event} {item_type}#{item_id}\" (change #{change_id})")]
    MissingPostState {
        change_id: u64,
        event: String,
        item_type: String,
        item_id: i64,
    },

    /// Replay stopped on an unprocessable record.
    #[error("{message}")]
    ReplayFailed {
        message: String,
        failed_event_id: u64,
        last_event_id: Option<u64>,
    },

    /// Sync history database failure.
    #[error("History store error: {0}")]
    History(#[from] sqlx::Error),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wrap an I/O error with the operation and path that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a transport error.
    pub fn transport(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Map this error onto the operator-facing taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::InvalidArgument(_) => ErrorCategory::Configuration,
            Self::Protocol(_)
            | Self::SizeMismatch { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Decompression(_) => ErrorCategory::Protocol,
            Self::LockContention { .. } => ErrorCategory::LockContention,
            Self::Store(_) | Self::MissingPostState { .. } | Self::ReplayFailed { .. } => {
                ErrorCategory::Replay
            }
            Self::Io { .. }
            | Self::Serialization(_)
            | Self::Transport { .. }
            | Self::History(_)
            | Self::Internal(_) => ErrorCategory::Other,
        }
    }

    /// True for size or checksum mismatches between control file and artifact.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::SizeMismatch { .. } | Self::ChecksumMismatch { .. })
    }

    /// Short stable label for metrics and result files.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Protocol(_) => "protocol",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Decompression(_) => "decompression",
            Self::LockContention { .. } => "lock_contention",
            Self::Io { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::Transport { .. } => "transport",
            Self::Store(StoreError::Validation(_)) => "validation",
            Self::Store(StoreError::Backend(_)) => "store",
            Self::MissingPostState { .. } => "missing_post_state",
            Self::ReplayFailed { .. } => "replay_failed",
            Self::History(_) => "history",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_is_configuration_category() {
        let err = SyncError::Config("sync.ftp.site is empty".to_string());
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.to_string().contains("sync.ftp.site"));
    }

    #[test]
    fn test_integrity_errors() {
        let size = SyncError::SizeMismatch {
            control: "20240101-RDY-0.ctl".to_string(),
            expected: 1000,
            actual: 998,
        };
        assert!(size.is_integrity_error());
        assert_eq!(size.category(), ErrorCategory::Protocol);
        assert!(size.to_string().contains("1000"));
        assert!(size.to_string().contains("998"));

        let checksum = SyncError::ChecksumMismatch {
            control: "c".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(checksum.is_integrity_error());
        assert_eq!(checksum.kind(), "checksum_mismatch");
    }

    #[test]
    fn test_protocol_error_is_not_integrity() {
        let err = SyncError::Protocol("malformed control file name".to_string());
        assert!(!err.is_integrity_error());
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn test_lock_contention_formatting() {
        let err = SyncError::LockContention {
            path: "/var/sync/1/changeset.json".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::LockContention);
        assert_eq!(
            err.to_string(),
            "Another process is writing to /var/sync/1/changeset.json"
        );
    }

    #[test]
    fn test_store_errors_are_replay_category() {
        let err = SyncError::from(StoreError::Backend("connection lost".to_string()));
        assert_eq!(err.category(), ErrorCategory::Replay);
        assert_eq!(err.kind(), "store");

        let err = SyncError::from(StoreError::Validation("title can't be blank".to_string()));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_missing_post_state_formatting() {
        let err = SyncError::MissingPostState {
            change_id: 42,
            event: "update".to_string(),
            item_type: "Book".to_string(),
            item_id: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("update Book#7"));
        assert!(msg.contains("#42"));
        assert_eq!(err.category(), ErrorCategory::Replay);
    }

    #[test]
    fn test_io_and_transport_are_other() {
        let err = SyncError::io(
            "open /tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.category(), ErrorCategory::Other);
        assert!(err.to_string().contains("/tmp/x"));

        let err = SyncError::transport("STOR", "connection reset");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert!(err.to_string().contains("STOR"));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::LockContention.to_string(), "lock_contention");
        assert_eq!(ErrorCategory::Replay.to_string(), "replay");
    }
}
