// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-set data model.
//!
//! A [`ChangeRecord`] is one audit-trail entry: the item's snapshot *before*
//! the event, the event kind, and its position in the global monotonic
//! sequence. A [`ChangeSet`] is one export batch: every record after a cursor
//! plus the `latest` map of live (redacted) rows for the touched items.
//!
//! ```text
//! ChangeSet
//! ├── since: 41                      # export cursor (exclusive)
//! ├── records: [42, 43, 47, ...]     # strictly ascending, all > since
//! └── latest: { "Book": { 10: {...} }, "Agent": { 3: {...} } }
//! ```
//!
//! [`ImportOutcome`] is what the replay engine reports and what the receiver
//! writes to a bucket's result file; the sender reads the cursor for its next
//! export back out of that file (see [`CursorSource`]).

use crate::bucket;
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// An attribute snapshot: column name to value.
pub type Attributes = serde_json::Map<String, Value>;

/// Item type name → item id → current redacted attributes.
pub type LatestMap = BTreeMap<String, BTreeMap<i64, Attributes>>;

/// Kind of event recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Destroy,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit-trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the global monotonic sequence.
    pub id: u64,
    /// Item type name (e.g. `"Book"`).
    pub item_type: String,
    /// Identifier of the changed item.
    pub item_id: i64,
    /// What happened to the item.
    pub event: EventKind,
    /// Snapshot of the item *before* the event. `None` for creations.
    pub object: Option<Attributes>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Summarize this record for logs and failure reports.
    pub fn summary(&self, item_attributes: Option<Attributes>) -> EventSummary {
        EventSummary {
            event_type: self.event,
            item_type: self.item_type.clone(),
            item_id: self.item_id,
            item_attributes,
        }
    }

    /// `"update Book#10"`
    pub fn label(&self) -> String {
        format!("{} {}#{}", self.event, self.item_type, self.item_id)
    }
}

/// One export batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Cursor the batch was exported from (exclusive lower bound).
    pub since: u64,
    /// Records in strictly ascending id order, all greater than `since`.
    pub records: Vec<ChangeRecord>,
    /// Live redacted rows, only for items touched by `records`.
    pub latest: LatestMap,
}

impl ChangeSet {
    /// Empty batch exported from `since`.
    pub fn empty(since: u64) -> Self {
        Self {
            since,
            records: Vec::new(),
            latest: LatestMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Id of the newest record, if any.
    pub fn last_id(&self) -> Option<u64> {
        self.records.last().map(|r| r.id)
    }

    /// The export-time live row for an item.
    pub fn latest_for(&self, item_type: &str, item_id: i64) -> Option<&Attributes> {
        self.latest.get(item_type).and_then(|rows| rows.get(&item_id))
    }
}

/// Event identity reported for a failed or skipped record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_type: EventKind,
    pub item_type: String,
    pub item_id: i64,
    pub item_attributes: Option<Attributes>,
}

/// Error details carried in a failed [`ImportOutcome`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Stable error label (see [`SyncError::kind`]).
    pub kind: String,
    pub message: String,
    /// Source chain, outermost first.
    pub trace: Vec<String>,
}

impl ErrorDescriptor {
    pub fn from_error(err: &SyncError) -> Self {
        let mut trace = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            trace,
        }
    }
}

/// Result of one replay attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub success: bool,
    /// Cursor after this attempt: the last processed record, or the export
    /// cursor when nothing was processed.
    pub last_event_id: Option<u64>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub failed_event_id: Option<u64>,
    pub failed_event_time: Option<DateTime<Utc>>,
    pub failed_event: Option<EventSummary>,
    pub exception: Option<ErrorDescriptor>,
}

impl ImportOutcome {
    /// Cursor the next export should start from.
    pub fn cursor(&self) -> Option<u64> {
        self.last_event_id
    }

    /// Operator-facing failure line, `None` on success.
    pub fn failure_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        let event = self
            .failed_event
            .as_ref()
            .map(|e| format!("{} {}#{}", e.event_type, e.item_type, e.item_id))
            .unwrap_or_else(|| "unknown event".to_string());
        let (message, kind) = self
            .exception
            .as_ref()
            .map(|e| (e.message.as_str(), e.kind.as_str()))
            .unwrap_or(("unknown error", "unknown"));
        Some(format!(
            "import failed on \"{}\" (change #{}): {} ({})",
            event,
            self.failed_event_id.unwrap_or_default(),
            message,
            kind
        ))
    }
}

/// Where the sender gets the cursor for its next export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorSource {
    /// Operator-supplied change id.
    Explicit(u64),
    /// Result file pulled back from the mirror.
    ResultFile(PathBuf),
}

impl CursorSource {
    /// Resolve to a concrete cursor.
    ///
    /// A result file that records no cursor is an argument error: the sender
    /// must be told explicitly where to start.
    pub fn resolve(&self) -> Result<u64> {
        match self {
            CursorSource::Explicit(id) => Ok(*id),
            CursorSource::ResultFile(path) => {
                let outcome = bucket::read_result_file(path)?;
                outcome.cursor().ok_or_else(|| {
                    SyncError::InvalidArgument(format!(
                        "no cursor in result file {}, specify an explicit export cursor",
                        path.display()
                    ))
                })
            }
        }
    }
}
