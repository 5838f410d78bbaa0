// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store integration traits.
//!
//! The persistence engine on each side is an external collaborator; only its
//! contract is used here.
//!
//! - [`ChangeStore`]: read-only view of the source's audit trail and live rows.
//! - [`ReplayTarget`]: the destination the replay engine writes to.
//!
//! [`MemoryStore`] implements both, for tests and standalone use.
//!
//! # Example
//!
//! ```rust,no_run
//! use catalog_sync::change::{Attributes, ChangeRecord};
//! use catalog_sync::store::{BoxFuture, ChangeStore};
//!
//! struct MyAuditLog { /* ... */ }
//!
//! impl ChangeStore for MyAuditLog {
//!     fn changes_after(&self, _cursor: u64) -> BoxFuture<'_, Vec<ChangeRecord>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn current_records(&self, _item_type: &str, _ids: &[i64]) -> BoxFuture<'_, Vec<(i64, Attributes)>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//! }
//! ```

use crate::change::{Attributes, ChangeRecord, EventKind};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

/// Name of the optimistic-concurrency counter attribute.
pub const CONCURRENCY_COUNTER: &str = "lock_version";

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Store-level failure.
///
/// The replay engine treats `Validation` as recoverable (skip and log) and
/// everything else as fatal for the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record failed the store's validation rules.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Any other persistence failure.
    #[error("{0}")]
    Backend(String),
}

/// Per-save options threaded into the store's create path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveContext {
    /// Item types whose create-time side effects must not run for this save.
    pub suppress_side_effects: BTreeSet<String>,
}

impl SaveContext {
    /// Context suppressing side effects for a single item type.
    pub fn suppressing(item_type: impl Into<String>) -> Self {
        Self {
            suppress_side_effects: BTreeSet::from([item_type.into()]),
        }
    }

    pub fn suppresses(&self, item_type: &str) -> bool {
        self.suppress_side_effects.contains(item_type)
    }
}

/// Read-only view of the source's audit trail.
pub trait ChangeStore: Send + Sync + 'static {
    /// All change records with id greater than `cursor`, ascending by id.
    fn changes_after(&self, cursor: u64) -> BoxFuture<'_, Vec<ChangeRecord>>;

    /// Current live rows of `item_type` among `ids`.
    ///
    /// Destroyed rows are simply absent from the result.
    fn current_records(&self, item_type: &str, ids: &[i64]) -> BoxFuture<'_, Vec<(i64, Attributes)>>;
}

/// Destination store written by the replay engine.
pub trait ReplayTarget: Send + Sync + 'static {
    /// Look up a row by id.
    fn find(&self, item_type: &str, id: i64) -> BoxFuture<'_, Option<Attributes>>;

    /// Persist a row with full validation.
    ///
    /// The row is identified by its `id` attribute. A row that does not exist
    /// yet is created, and the store runs its create-time side effects unless
    /// `ctx` suppresses them for `item_type`.
    fn save(&self, item_type: &str, record: Attributes, ctx: &SaveContext) -> BoxFuture<'_, ()>;

    /// Delete a row. Returns `false` if it was already gone.
    fn destroy(&self, item_type: &str, id: i64) -> BoxFuture<'_, bool>;

    /// Flush the external search index.
    ///
    /// Default implementation does nothing.
    fn flush_index(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Dependent row auto-provisioned when a row of some type is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSideEffect {
    /// Type of the provisioned row.
    pub dependent_type: String,
    /// Attribute on the provisioned row pointing back to the new row.
    pub foreign_key: String,
}

/// In-memory implementation of [`ChangeStore`] and [`ReplayTarget`].
///
/// Tables are keyed by item type and row id. Supports:
/// - required-field validation per item type
/// - an optimistic-concurrency counter ([`CONCURRENCY_COUNTER`]); saving an
///   existing row with a stale counter fails
/// - create-time side effects, honoring [`SaveContext`]
/// - backend failure injection for a specific row
/// - counting index flushes
#[derive(Default)]
pub struct MemoryStore {
    versions: RwLock<Vec<ChangeRecord>>,
    tables: RwLock<HashMap<String, BTreeMap<i64, Attributes>>>,
    required_fields: HashMap<String, Vec<String>>,
    side_effects: HashMap<String, Vec<CreateSideEffect>>,
    failing_rows: RwLock<BTreeSet<(String, i64)>>,
    flush_count: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject saves of `item_type` rows missing any of `fields` (or holding null).
    pub fn with_required_fields(mut self, item_type: &str, fields: &[&str]) -> Self {
        self.required_fields.insert(
            item_type.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        );
        self
    }

    /// Provision a `dependent_type` row whenever an `item_type` row is created.
    pub fn with_create_side_effect(mut self, item_type: &str, effect: CreateSideEffect) -> Self {
        self.side_effects
            .entry(item_type.to_string())
            .or_default()
            .push(effect);
        self
    }

    /// Make every save or destroy of this row fail with a backend error.
    pub async fn fail_row(&self, item_type: &str, id: i64) {
        self.failing_rows
            .write()
            .await
            .insert((item_type.to_string(), id));
    }

    /// Stop injecting failures.
    pub async fn clear_failures(&self) {
        self.failing_rows.write().await.clear();
    }

    /// Insert or replace a live row directly, bypassing validation and
    /// side effects.
    pub async fn put_row(&self, item_type: &str, row: Attributes) {
        let id = row_id(&row).unwrap_or_default();
        self.tables
            .write()
            .await
            .entry(item_type.to_string())
            .or_default()
            .insert(id, row);
    }

    /// Append an audit-trail entry. Ids are assigned sequentially from 1.
    pub async fn record_change(
        &self,
        item_type: &str,
        item_id: i64,
        event: EventKind,
        object: Option<Attributes>,
    ) -> u64 {
        let mut versions = self.versions.write().await;
        let id = versions.last().map(|v| v.id + 1).unwrap_or(1);
        versions.push(ChangeRecord {
            id,
            item_type: item_type.to_string(),
            item_id,
            event,
            object,
            created_at: Utc::now(),
        });
        id
    }

    /// Append a fully-formed audit-trail entry.
    pub async fn push_change(&self, record: ChangeRecord) {
        self.versions.write().await.push(record);
    }

    /// Snapshot of a table, ordered by id.
    pub async fn rows(&self, item_type: &str) -> BTreeMap<i64, Attributes> {
        self.tables
            .read()
            .await
            .get(item_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of index flushes so far.
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    async fn check_failure(&self, item_type: &str, id: i64) -> StoreResult<()> {
        if self
            .failing_rows
            .read()
            .await
            .contains(&(item_type.to_string(), id))
        {
            return Err(StoreError::Backend(format!(
                "simulated failure for {}#{}",
                item_type, id
            )));
        }
        Ok(())
    }

    fn validate(&self, item_type: &str, record: &Attributes) -> StoreResult<()> {
        let Some(required) = self.required_fields.get(item_type) else {
            return Ok(());
        };
        let missing: Vec<&str> = required
            .iter()
            .filter(|f| matches!(record.get(f.as_str()), None | Some(Value::Null)))
            .map(|f| f.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Validation(format!(
                "{} can't be blank",
                missing.join(", ")
            )))
        }
    }
}

/// Row id from the `id` attribute.
pub fn row_id(row: &Attributes) -> Option<i64> {
    match row.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn counter_of(row: &Attributes) -> i64 {
    row.get(CONCURRENCY_COUNTER)
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

impl ChangeStore for MemoryStore {
    fn changes_after(&self, cursor: u64) -> BoxFuture<'_, Vec<ChangeRecord>> {
        Box::pin(async move {
            let mut records: Vec<ChangeRecord> = self
                .versions
                .read()
                .await
                .iter()
                .filter(|v| v.id > cursor)
                .cloned()
                .collect();
            records.sort_by_key(|r| r.id);
            Ok(records)
        })
    }

    fn current_records(&self, item_type: &str, ids: &[i64]) -> BoxFuture<'_, Vec<(i64, Attributes)>> {
        let item_type = item_type.to_string();
        let ids = ids.to_vec();
        Box::pin(async move {
            let tables = self.tables.read().await;
            let Some(table) = tables.get(&item_type) else {
                return Ok(Vec::new());
            };
            Ok(ids
                .into_iter()
                .filter_map(|id| table.get(&id).map(|row| (id, row.clone())))
                .collect())
        })
    }
}

impl ReplayTarget for MemoryStore {
    fn find(&self, item_type: &str, id: i64) -> BoxFuture<'_, Option<Attributes>> {
        let item_type = item_type.to_string();
        Box::pin(async move {
            Ok(self
                .tables
                .read()
                .await
                .get(&item_type)
                .and_then(|t| t.get(&id))
                .cloned())
        })
    }

    fn save(&self, item_type: &str, record: Attributes, ctx: &SaveContext) -> BoxFuture<'_, ()> {
        let item_type = item_type.to_string();
        let suppressed = ctx.suppresses(&item_type);
        Box::pin(async move {
            let id = row_id(&record)
                .ok_or_else(|| StoreError::Validation("id can't be blank".to_string()))?;
            self.check_failure(&item_type, id).await?;
            self.validate(&item_type, &record)?;

            let mut tables = self.tables.write().await;
            let table = tables.entry(item_type.clone()).or_default();
            let mut record = record;

            let is_new = match table.get(&id) {
                Some(existing) => {
                    let stored = counter_of(existing);
                    if counter_of(&record) != stored {
                        return Err(StoreError::Backend(format!(
                            "stale object {}#{}: lock_version {} != {}",
                            item_type,
                            id,
                            counter_of(&record),
                            stored
                        )));
                    }
                    record.insert(CONCURRENCY_COUNTER.to_string(), Value::from(stored + 1));
                    false
                }
                None => {
                    record.insert(CONCURRENCY_COUNTER.to_string(), Value::from(0));
                    true
                }
            };
            table.insert(id, record);

            if is_new && !suppressed {
                for effect in self.side_effects.get(&item_type).into_iter().flatten() {
                    let dependent = tables.entry(effect.dependent_type.clone()).or_default();
                    let dependent_id = dependent.keys().next_back().map(|k| k + 1).unwrap_or(1);
                    let mut row = Attributes::new();
                    row.insert("id".to_string(), Value::from(dependent_id));
                    row.insert(effect.foreign_key.clone(), Value::from(id));
                    row.insert(CONCURRENCY_COUNTER.to_string(), Value::from(0));
                    dependent.insert(dependent_id, row);
                }
            }
            Ok(())
        })
    }

    fn destroy(&self, item_type: &str, id: i64) -> BoxFuture<'_, bool> {
        let item_type = item_type.to_string();
        Box::pin(async move {
            self.check_failure(&item_type, id).await?;
            Ok(self
                .tables
                .write()
                .await
                .get_mut(&item_type)
                .and_then(|t| t.remove(&id))
                .is_some())
        })
    }

    fn flush_index(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.flush_count.fetch_add(1, Ordering::SeqCst);
            tracing::trace!("MemoryStore: index flushed");
            Ok(())
        })
    }
}
