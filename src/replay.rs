// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-set replay against a destination store.
//!
//! # Post-state resolution
//!
//! The audit trail records each item's state *before* an event. The state
//! *after* event N of an item is therefore:
//!
//! 1. the snapshot of the next record for the same item in this set, or
//! 2. the export-time `latest` entry when no later record exists.
//!
//! Records are applied in global id order; the lookup uses each item's own
//! sub-sequence.
//!
//! ```text
//! records:  #5 Book#10 create   #6 Book#11 create   #7 Book#10 update
//! Book#10:  #5 ──post──▶ object(#7)                 #7 ──post──▶ latest[Book][10]
//! ```
//!
//! A create/update with neither source fails with
//! [`SyncError::MissingPostState`]; attributes are never silently nulled.
//!
//! # Failure handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | `StoreError::Validation` | record skipped, appended to the side error log, replay continues |
//! | anything else | replay stops; outcome names the failed record and the last applied one |
//!
//! Nothing is rolled back. The index flush runs exactly once per attempt,
//! whatever happened.

use crate::change::{Attributes, ChangeRecord, ChangeSet, ErrorDescriptor, EventKind, ImportOutcome};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::registry::ItemTypeRegistry;
use crate::store::{row_id, ReplayTarget, SaveContext, StoreError, CONCURRENCY_COUNTER};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Append-only side log of records skipped for validation errors.
///
/// Each entry names the change id, item and event so an operator can retry
/// the record by hand.
#[derive(Debug, Clone)]
pub struct ImportErrorLog {
    path: PathBuf,
}

impl ImportErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one skipped record.
    pub fn append(&self, record: &ChangeRecord, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::io(format!("create {}", parent.display()), e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SyncError::io(format!("open {}", self.path.display()), e))?;
        writeln!(
            file,
            "{}: change_id={} item_type={} item_id={} event={}\n{}\n",
            Utc::now().to_rfc3339(),
            record.id,
            record.item_type,
            record.item_id,
            record.event,
            message
        )
        .map_err(|e| SyncError::io(format!("append {}", self.path.display()), e))
    }
}

/// Applies change-sets to a [`ReplayTarget`].
pub struct ReplayImporter<D: ReplayTarget> {
    target: Arc<D>,
    registry: Arc<ItemTypeRegistry>,
    error_log: ImportErrorLog,
}

/// Why replay of one record stopped the batch.
struct Halt {
    error: SyncError,
    post_state: Option<Attributes>,
}

impl<D: ReplayTarget> ReplayImporter<D> {
    pub fn new(target: Arc<D>, registry: Arc<ItemTypeRegistry>, error_log: ImportErrorLog) -> Self {
        Self {
            target,
            registry,
            error_log,
        }
    }

    pub fn target(&self) -> &Arc<D> {
        &self.target
    }

    pub fn error_log(&self) -> &ImportErrorLog {
        &self.error_log
    }

    /// Apply a change-set and report how far it got.
    ///
    /// Never returns an error: failures are reported in the outcome.
    pub async fn replay(&self, changeset: &ChangeSet) -> ImportOutcome {
        let started = Instant::now();

        // Per-item queues of record positions, in set order.
        let mut per_item: HashMap<(&str, i64), VecDeque<usize>> = HashMap::new();
        for (index, record) in changeset.records.iter().enumerate() {
            per_item
                .entry((record.item_type.as_str(), record.item_id))
                .or_default()
                .push_back(index);
        }

        let mut last_processed: Option<&ChangeRecord> = None;
        let mut applied = 0usize;
        let mut skipped = 0usize;
        let mut halted: Option<(&ChangeRecord, Halt)> = None;

        for record in &changeset.records {
            let next = per_item
                .get_mut(&(record.item_type.as_str(), record.item_id))
                .and_then(|queue| {
                    queue.pop_front();
                    queue.front().copied()
                })
                .map(|index| &changeset.records[index]);

            match self.apply(record, next, changeset).await {
                Ok(true) => applied += 1,
                Ok(false) => skipped += 1,
                Err(halt) => {
                    halted = Some((record, halt));
                    break;
                }
            }
            last_processed = Some(record);
        }

        if let Err(e) = self.target.flush_index().await {
            warn!(error = %e, "Index flush failed");
        }

        let failed = usize::from(halted.is_some());
        metrics::record_replay(applied, skipped, failed, started.elapsed());

        let last_event_id = last_processed.map(|r| r.id).or(Some(changeset.since));
        let last_event_time = last_processed.map(|r| r.created_at);

        match halted {
            None => {
                info!(
                    records = changeset.len(),
                    applied,
                    skipped,
                    last_event_id = ?last_event_id,
                    "Replay complete"
                );
                ImportOutcome {
                    success: true,
                    last_event_id,
                    last_event_time,
                    failed_event_id: None,
                    failed_event_time: None,
                    failed_event: None,
                    exception: None,
                }
            }
            Some((record, halt)) => {
                let outcome = ImportOutcome {
                    success: false,
                    last_event_id,
                    last_event_time,
                    failed_event_id: Some(record.id),
                    failed_event_time: Some(record.created_at),
                    failed_event: Some(record.summary(halt.post_state)),
                    exception: Some(ErrorDescriptor::from_error(&halt.error)),
                };
                warn!(
                    applied,
                    skipped,
                    error_kind = halt.error.kind(),
                    "{}",
                    outcome.failure_message().unwrap_or_default()
                );
                outcome
            }
        }
    }

    /// Apply one record. `Ok(false)` means it was skipped for validation.
    async fn apply(
        &self,
        record: &ChangeRecord,
        next: Option<&ChangeRecord>,
        changeset: &ChangeSet,
    ) -> std::result::Result<bool, Halt> {
        match record.event {
            EventKind::Destroy => {
                let removed = self
                    .target
                    .destroy(&record.item_type, record.item_id)
                    .await
                    .map_err(|e| Halt {
                        error: e.into(),
                        post_state: None,
                    })?;
                debug!(change_id = record.id, item = %record.label(), removed, "Applied destroy");
                Ok(true)
            }
            EventKind::Create | EventKind::Update => {
                let post_state = match next {
                    Some(next) => next.object.clone(),
                    None => changeset
                        .latest_for(&record.item_type, record.item_id)
                        .cloned(),
                };
                let Some(post_state) = post_state else {
                    return Err(Halt {
                        error: SyncError::MissingPostState {
                            change_id: record.id,
                            event: record.event.to_string(),
                            item_type: record.item_type.clone(),
                            item_id: record.item_id,
                        },
                        post_state: None,
                    });
                };

                match self.upsert(record, &post_state).await {
                    Ok(()) => {
                        debug!(change_id = record.id, item = %record.label(), "Applied");
                        Ok(true)
                    }
                    Err(StoreError::Validation(message)) => {
                        warn!(
                            change_id = record.id,
                            item = %record.label(),
                            error = %message,
                            "Ignored validation error"
                        );
                        if let Err(e) = self.error_log.append(record, &message) {
                            warn!(error = %e, "Failed to write import error log");
                        }
                        Ok(false)
                    }
                    Err(e) => Err(Halt {
                        error: e.into(),
                        post_state: Some(post_state),
                    }),
                }
            }
        }
    }

    async fn upsert(&self, record: &ChangeRecord, post_state: &Attributes) -> std::result::Result<(), StoreError> {
        let id = row_id(post_state).unwrap_or(record.item_id);
        let existing = self.target.find(&record.item_type, id).await?;

        let mut row: Attributes = post_state
            .iter()
            .filter(|(name, _)| name.as_str() != CONCURRENCY_COUNTER)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        row.insert("id".to_string(), Value::from(id));

        let ctx = match &existing {
            Some(current) => {
                if let Some(counter) = current.get(CONCURRENCY_COUNTER) {
                    row.insert(CONCURRENCY_COUNTER.to_string(), counter.clone());
                }
                SaveContext::default()
            }
            None if self.registry.suppresses_hooks(&record.item_type) => {
                SaveContext::suppressing(record.item_type.clone())
            }
            None => SaveContext::default(),
        };

        self.target.save(&record.item_type, row, &ctx).await
    }
}
