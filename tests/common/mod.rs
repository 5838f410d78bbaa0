//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A source database that keeps its audit trail the way a live catalog does
//! - A two-sided sync site (sender, receiver, shared remote directory)
//! - A notifier that records what it was told
//! - Test logging (`RUST_LOG` filtered, captured per test)

#![allow(dead_code)]

use catalog_sync::change::{Attributes, ChangeRecord, EventKind};
use catalog_sync::coordinator::{Notifier, RunContext, SyncOrchestrator};
use catalog_sync::store::{MemoryStore, ReplayTarget, CONCURRENCY_COUNTER};
use catalog_sync::{
    DiffExporter, DirectoryTransport, ImportErrorLog, ReplayImporter, SyncConfig, SyncError,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("catalog_sync=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn attrs(value: Value) -> Attributes {
    value.as_object().cloned().expect("object literal")
}

/// Build a change record by hand.
pub fn record(id: u64, item_type: &str, item_id: i64, event: EventKind, object: Option<Value>) -> ChangeRecord {
    ChangeRecord {
        id,
        item_type: item_type.to_string(),
        item_id,
        event,
        object: object.map(attrs),
        created_at: Utc::now(),
    }
}

/// Rows with the concurrency counter removed, for comparing two stores.
pub fn without_counter(rows: BTreeMap<i64, Attributes>) -> BTreeMap<i64, Attributes> {
    rows.into_iter()
        .map(|(id, mut row)| {
            row.remove(CONCURRENCY_COUNTER);
            (id, row)
        })
        .collect()
}

// =============================================================================
// Source database
// =============================================================================

/// Source-side catalog: every write appends a pre-event snapshot to the
/// audit trail, like the live system's change tracking.
pub struct SourceDb {
    pub store: Arc<MemoryStore>,
}

impl SourceDb {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub async fn create(&self, item_type: &str, row: Value) -> u64 {
        let row = attrs(row);
        let id = row.get("id").and_then(Value::as_i64).expect("row id");
        let change = self.store.record_change(item_type, id, EventKind::Create, None).await;
        self.store.put_row(item_type, row).await;
        change
    }

    pub async fn update(&self, item_type: &str, id: i64, changes: Value) -> u64 {
        let before = self.store.rows(item_type).await.remove(&id).expect("row exists");
        let mut after = before.clone();
        after.extend(attrs(changes));
        let change = self
            .store
            .record_change(item_type, id, EventKind::Update, Some(before))
            .await;
        self.store.put_row(item_type, after).await;
        change
    }

    pub async fn destroy(&self, item_type: &str, id: i64) -> u64 {
        let before = self.store.rows(item_type).await.remove(&id).expect("row exists");
        let change = self
            .store
            .record_change(item_type, id, EventKind::Destroy, Some(before))
            .await;
        ReplayTarget::destroy(self.store.as_ref(), item_type, id)
            .await
            .expect("destroy");
        change
    }

    pub async fn rows(&self, item_type: &str) -> BTreeMap<i64, Attributes> {
        self.store.rows(item_type).await
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Records every notification as `(context, error kind)`.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(String, &'static str)>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().iter().map(|(_, kind)| *kind).collect()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(ctx, _)| ctx.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, ctx: &RunContext, error: &SyncError) {
        self.seen.lock().unwrap().push((ctx.to_string(), error.kind()));
    }
}

// =============================================================================
// Sync site
// =============================================================================

/// Sender and receiver on one machine. The remote root is the receiver's
/// sync root, as with an FTP server serving the mirror's directory.
pub struct SyncSite {
    pub root: TempDir,
    pub config: SyncConfig,
    pub source: SourceDb,
    pub dest: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub orchestrator: SyncOrchestrator<DirectoryTransport, RecordingNotifier>,
}

impl SyncSite {
    pub fn new() -> Self {
        Self::with_dest(MemoryStore::new())
    }

    pub fn with_dest(dest: MemoryStore) -> Self {
        init_tracing();
        let root = TempDir::new().expect("tempdir");
        let config = SyncConfig::for_testing(root.path());
        let transport = Arc::new(DirectoryTransport::new(&config.slave.base_dir));
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = SyncOrchestrator::with_notifier(config.clone(), transport, Arc::clone(&notifier));
        Self {
            root,
            config,
            source: SourceDb::new(),
            dest: Arc::new(dest),
            notifier,
            orchestrator,
        }
    }

    pub fn exporter(&self) -> DiffExporter<MemoryStore> {
        DiffExporter::new(Arc::clone(&self.source.store), Arc::new(self.config.registry.clone()))
    }

    pub fn importer(&self) -> ReplayImporter<MemoryStore> {
        ReplayImporter::new(
            Arc::clone(&self.dest),
            Arc::new(self.config.registry.clone()),
            ImportErrorLog::new(&self.config.import_error_log),
        )
    }

    pub fn import_log(&self) -> String {
        std::fs::read_to_string(&self.config.import_error_log).unwrap_or_default()
    }
}
