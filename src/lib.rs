//! # Catalog Sync
//!
//! Incremental one-way replication of a catalog database to a mirror
//! instance, using checksummed file buckets moved over FTP (or any shared
//! directory).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── sender (master) ─────────────────────────────┐
//! │                                                                          │
//! │  ┌─────────────┐   ┌──────────┐   ┌──────────────┐   ┌─────────────────┐ │
//! │  │ ChangeStore │──►│ Redactor │──►│ DiffExporter │──►│ pack → RDY .ctl │ │
//! │  │ (audit log) │   └──────────┘   └──────────────┘   └────────┬────────┘ │
//! │  └─────────────┘                                              │ push     │
//! └───────────────────────────────────────────────────────────────┼──────────┘
//!                                                                 ▼
//! ┌──────────────────────────── receiver (slave) ────────────────────────────┐
//! │                                                                          │
//! │  ┌───────────────────┐   ┌────────────────┐   ┌───────────────────────┐  │
//! │  │ unpack + verify   │──►│ ReplayImporter │──►│ status.json, IMP/ERR  │  │
//! │  │ (size, checksum)  │   │ (ReplayTarget) │   │ (pulled by sender)    │  │
//! │  └───────────────────┘   └────────────────┘   └───────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The cursor (last applied change id) travels back to the sender in the
//! result file, which becomes the lower bound of the next export.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use catalog_sync::{
//!     BucketId, CursorSource, DiffExporter, DirectoryTransport, MemoryStore, SyncConfig,
//!     SyncOrchestrator,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> catalog_sync::Result<()> {
//!     let config = SyncConfig::for_testing(Path::new("/var/lib/catalog/sync"));
//!     let transport = Arc::new(DirectoryTransport::new("/mnt/mirror/sync"));
//!     let orchestrator = SyncOrchestrator::new(config.clone(), transport);
//!
//!     let cursor = match orchestrator.pull_status().await? {
//!         Some(status) => CursorSource::ResultFile(status),
//!         None => CursorSource::Explicit(0),
//!     };
//!     let exporter = DiffExporter::new(Arc::new(MemoryStore::new()), Arc::new(config.registry.clone()));
//!     orchestrator.send(&exporter, BucketId(20241029), cursor).await?;
//!     Ok(())
//! }
//! ```

pub mod bucket;
pub mod change;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod history;
pub mod metrics;
pub mod redact;
pub mod registry;
pub mod replay;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use bucket::{BucketArtifact, BucketId, ControlFile, ControlName, ControlStatus};
pub use change::{ChangeRecord, ChangeSet, CursorSource, EventKind, ImportOutcome};
pub use config::{HistoryConfig, SideConfig, SyncConfig, TransportConfig};
pub use coordinator::{LogNotifier, Notifier, ReceiveReport, RunContext, SendReport, SyncOrchestrator};
pub use error::{Result, SyncError};
pub use export::DiffExporter;
pub use history::SyncHistoryStore;
pub use redact::Redactor;
pub use registry::{ItemTypeDescriptor, ItemTypeRegistry};
pub use replay::{ImportErrorLog, ReplayImporter};
pub use store::{ChangeStore, MemoryStore, ReplayTarget, StoreError};
pub use transport::{DirectoryTransport, FtpTransport, Transport};
