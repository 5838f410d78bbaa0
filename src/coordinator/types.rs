//! Run context and reports.
//!
//! A [`RunContext`] names the step being run and the bucket it concerns. It
//! is passed by parameter to every helper that logs or notifies, and it owns
//! the span a step runs under, so each event carries `action` and
//! `bucket_id` fields.

use crate::bucket::{BucketId, ControlStatus};
use crate::change::ImportOutcome;
use std::path::PathBuf;
use tracing::Span;

/// The step a run is performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub action: &'static str,
    pub bucket_id: Option<BucketId>,
}

impl RunContext {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            bucket_id: None,
        }
    }

    pub fn with_bucket(self, bucket_id: BucketId) -> Self {
        Self {
            bucket_id: Some(bucket_id),
            ..self
        }
    }

    /// Span for this step.
    pub fn span(&self) -> Span {
        tracing::info_span!("sync_run", action = self.action, bucket_id = %self.bucket_label())
    }

    /// Bucket id for log lines and notifications, `-` when there is none.
    pub fn bucket_label(&self) -> String {
        self.bucket_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

impl std::fmt::Display for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [bucket {}]", self.action, self.bucket_label())
    }
}

/// What a sender run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Bucket built by this run.
    pub bucket_id: BucketId,
    /// Export cursor the change-set was built from.
    pub since: u64,
    /// Records in the change-set.
    pub records: usize,
    /// Status the new bucket was created in: `RDY`, or `END` when nothing changed.
    pub packed: ControlStatus,
    /// Buckets pushed, in push order. Includes resent `ERR` buckets.
    pub pushed: Vec<BucketId>,
}

impl SendReport {
    pub fn unchanged(&self) -> bool {
        self.packed == ControlStatus::End
    }
}

/// One imported bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketImport {
    pub bucket_id: BucketId,
    pub outcome: ImportOutcome,
    /// Control status after the import.
    pub status: ControlStatus,
    pub result_file: PathBuf,
}

/// What a receiver run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveReport {
    pub imports: Vec<BucketImport>,
}

impl ReceiveReport {
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }

    /// Cursor reached by the last imported bucket.
    pub fn cursor(&self) -> Option<u64> {
        self.imports.last().and_then(|i| i.outcome.cursor())
    }
}
