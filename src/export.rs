// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Diff export: audit trail → change-set.
//!
//! # Flow
//!
//! ```text
//! cursor C ──▶ changes_after(C) ──▶ redact each ──▶ group touched items
//!                                                        │
//!                       latest map ◀── redact ◀── current_records(type, ids)
//! ```
//!
//! Read-only against the store, no file or network I/O. Records are
//! re-filtered and re-sorted locally so the output holds regardless of how
//! the store orders or bounds its query: every id is `> C`, strictly
//! ascending, no duplicates.

use crate::change::{ChangeRecord, ChangeSet};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::redact::Redactor;
use crate::registry::ItemTypeRegistry;
use crate::store::ChangeStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Builds change-sets from a [`ChangeStore`].
pub struct DiffExporter<S: ChangeStore> {
    store: Arc<S>,
    redactor: Redactor,
}

impl<S: ChangeStore> DiffExporter<S> {
    pub fn new(store: Arc<S>, registry: Arc<ItemTypeRegistry>) -> Self {
        Self {
            store,
            redactor: Redactor::new(registry),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Export every change after `cursor`.
    ///
    /// Fails with [`SyncError::InvalidArgument`] when no cursor is given.
    #[instrument(skip(self))]
    pub async fn export(&self, cursor: Option<u64>) -> Result<ChangeSet> {
        let cursor = cursor.ok_or_else(|| {
            SyncError::InvalidArgument("an export cursor (last applied change id) is required".to_string())
        })?;

        let mut records: Vec<ChangeRecord> = self
            .store
            .changes_after(cursor)
            .await?
            .into_iter()
            .filter(|r| r.id > cursor)
            .collect();
        records.sort_by_key(|r| r.id);
        records.dedup_by_key(|r| r.id);

        let records: Vec<ChangeRecord> = records
            .iter()
            .map(|r| self.redactor.redact_record(r))
            .collect();

        let mut touched: BTreeMap<&str, BTreeSet<i64>> = BTreeMap::new();
        for record in &records {
            touched
                .entry(record.item_type.as_str())
                .or_default()
                .insert(record.item_id);
        }

        let mut changeset = ChangeSet::empty(cursor);
        for (item_type, ids) in touched {
            let ids: Vec<i64> = ids.into_iter().collect();
            let rows = self.store.current_records(item_type, &ids).await?;
            debug!(item_type, requested = ids.len(), live = rows.len(), "Fetched latest rows");

            for (id, row) in rows {
                // Only items touched by this set belong in the map.
                if ids.binary_search(&id).is_err() {
                    continue;
                }
                changeset
                    .latest
                    .entry(item_type.to_string())
                    .or_default()
                    .insert(id, self.redactor.redact(item_type, &row));
            }
        }
        changeset.records = records;

        metrics::record_records_exported(changeset.len());
        info!(
            since = cursor,
            records = changeset.len(),
            last_id = ?changeset.last_id(),
            "Exported change-set"
        );
        Ok(changeset)
    }
}
