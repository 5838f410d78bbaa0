//! Configuration for catalog sync.
//!
//! This module defines all configuration consumed by the sync core. The
//! key-value loader that produces it lives outside the crate; here the values
//! are plain serde structs that can be built programmatically or deserialized
//! from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use catalog_sync::config::{SyncConfig, TransportConfig};
//!
//! let config = SyncConfig {
//!     transport: TransportConfig::for_testing("ftp.mirror.example.org"),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── transport: TransportConfig    # remote endpoint (sync.ftp.*)
//! ├── master: SideConfig            # sender sync root
//! ├── slave: SideConfig             # receiver sync root
//! ├── import_error_log: PathBuf     # side log of skipped records
//! ├── history: HistoryConfig        # SQLite run history
//! └── registry: ItemTypeRegistry    # per-type redaction and hook rules
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! transport:
//!   site: "ftp.mirror.example.org"
//!   user: "sync"
//!   password: "secret"
//!   directory: "/sync"
//!   passive: true
//!
//! master:
//!   base_dir: "/var/lib/catalog/sync/master"
//! slave:
//!   base_dir: "/var/lib/catalog/sync/slave"
//!
//! history:
//!   sqlite_path: "/var/lib/catalog/sync_histories.db"
//! ```

use crate::error::{Result, SyncError};
use crate::registry::ItemTypeRegistry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a sender or receiver run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote endpoint and credentials.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Sender side: buckets are built here before pushing.
    #[serde(default = "default_master")]
    pub master: SideConfig,

    /// Receiver side: pushed buckets land here and are imported.
    #[serde(default = "default_slave")]
    pub slave: SideConfig,

    /// Side log for records skipped because of validation errors.
    #[serde(default = "default_import_error_log")]
    pub import_error_log: PathBuf,

    /// Sync history persistence.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Per-item-type behavior.
    #[serde(default)]
    pub registry: ItemTypeRegistry,
}

fn default_master() -> SideConfig {
    SideConfig {
        base_dir: PathBuf::from("sync/master"),
    }
}

fn default_slave() -> SideConfig {
    SideConfig {
        base_dir: PathBuf::from("sync/slave"),
    }
}

fn default_import_error_log() -> PathBuf {
    PathBuf::from("log/sync_import.log")
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            master: default_master(),
            slave: default_slave(),
            import_error_log: default_import_error_log(),
            history: HistoryConfig::default(),
            registry: ItemTypeRegistry::default(),
        }
    }
}

impl SyncConfig {
    /// Config rooted in `root` with a filled-in endpoint and in-memory history.
    pub fn for_testing(root: &Path) -> Self {
        Self {
            transport: TransportConfig::for_testing("localhost"),
            master: SideConfig {
                base_dir: root.join("master"),
            },
            slave: SideConfig {
                base_dir: root.join("slave"),
            },
            import_error_log: root.join("log").join("sync_import.log"),
            history: HistoryConfig::in_memory(),
            registry: ItemTypeRegistry::catalog(),
        }
    }

    /// Check everything a run needs before any file is touched.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }

    /// Operator-facing summary. Never includes the password.
    pub fn summary(&self) -> String {
        format!(
            "{}\n sync.master.base_directory: {}\n sync.slave.base_directory: {}\n sync.import_error_log: {}\n sync.history: {}",
            self.transport.summary(),
            self.master.base_dir.display(),
            self.slave.base_dir.display(),
            self.import_error_log.display(),
            if self.history.enabled {
                self.history.sqlite_path.as_str()
            } else {
                "disabled"
            }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransportConfig: remote endpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote endpoint settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Host, optionally `host:port`.
    #[serde(default)]
    pub site: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Remote sync root; buckets are created beneath it.
    #[serde(default)]
    pub directory: String,

    /// Use passive-mode data connections.
    #[serde(default = "default_true")]
    pub passive: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            site: String::new(),
            user: String::new(),
            password: String::new(),
            directory: String::new(),
            passive: true,
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("site", &self.site)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("directory", &self.directory)
            .field("passive", &self.passive)
            .finish()
    }
}

impl TransportConfig {
    /// Endpoint with placeholder credentials.
    pub fn for_testing(site: &str) -> Self {
        Self {
            site: site.to_string(),
            user: "sync".to_string(),
            password: "sync".to_string(),
            directory: String::new(),
            passive: true,
        }
    }

    /// Fail with [`SyncError::Config`] when the endpoint or credentials are blank.
    pub fn validate(&self) -> Result<()> {
        if self.site.trim().is_empty() {
            return Err(SyncError::Config("sync.ftp.site is empty".to_string()));
        }
        if self.user.trim().is_empty() || self.password.is_empty() {
            return Err(SyncError::Config(
                "sync.ftp.user or sync.ftp.password is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port`, defaulting to port 21.
    pub fn address(&self) -> String {
        let site = self.site.trim();
        if site.contains(':') {
            site.to_string()
        } else {
            format!("{}:21", site)
        }
    }

    pub fn summary(&self) -> String {
        let password = if self.password.is_empty() { "" } else { "********" };
        format!(
            " sync.ftp.site: {}\n sync.ftp.user: {}\n sync.ftp.password: {}\n sync.ftp.directory: {}\n sync.ftp.passive: {}",
            self.site, self.user, password, self.directory, self.passive
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SideConfig: local sync root
// ═══════════════════════════════════════════════════════════════════════════════

/// One side's local sync root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideConfig {
    pub base_dir: PathBuf,
}

impl SideConfig {
    /// Where the sender keeps the pulled result file.
    pub fn work_dir(&self) -> PathBuf {
        self.base_dir.join(crate::bucket::WORK_DIR)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HistoryConfig: sync history persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync history configuration.
///
/// One row per export, push and import run, kept in SQLite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_history_path")]
    pub sqlite_path: String,

    /// Record history at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_history_path() -> String {
    "sync_histories.db".to_string()
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_history_path(),
            enabled: true,
            wal_mode: true,
        }
    }
}

impl HistoryConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            enabled: true,
            wal_mode: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
