// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync history persistence.
//!
//! One row per export, push and import run, kept in SQLite so operators can
//! see what each side did and which change id it reached.
//!
//! ```text
//! sync_histories
//! ├── id               INTEGER PRIMARY KEY
//! ├── action_name      TEXT     export | push | import
//! ├── state            TEXT     success | failure | empty
//! ├── message          TEXT     operator-facing detail, nullable
//! ├── sync_version_id  INTEGER  change id reached by the run
//! ├── created_at       INTEGER  unix millis
//! └── updated_at       INTEGER  unix millis
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended (an operator reading it while a run writes). Every statement
//! is retried with exponential backoff, up to a fixed number of attempts.

use crate::config::HistoryConfig;
use crate::error::{Result, SyncError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const IN_MEMORY: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::history_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// What a history row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Export,
    Push,
    Import,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Export => "export",
            SyncAction::Push => "push",
            SyncAction::Import => "import",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Success,
    Failure,
    /// Nothing to do.
    Empty,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Success => "success",
            SyncState::Failure => "failure",
            SyncState::Empty => "empty",
        }
    }
}

/// One stored history row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub action_name: String,
    pub state: String,
    pub message: Option<String>,
    pub sync_version_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// SQLite-backed sync history.
pub struct SyncHistoryStore {
    pool: SqlitePool,
    path: String,
}

impl SyncHistoryStore {
    /// Open the store described by `config`.
    pub async fn open(config: &HistoryConfig) -> Result<Self> {
        Self::connect(&config.sqlite_path, config.wal_mode).await
    }

    /// Open (creating if needed) a history database at `path`.
    pub async fn new(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        Self::connect(&path, true).await
    }

    async fn connect(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, "Initializing sync history store");

        let in_memory = path == IN_MEMORY;
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let journal = if wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Memory
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_histories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_name TEXT NOT NULL,
                state TEXT NOT NULL,
                message TEXT,
                sync_version_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sync_histories_index_1 \
             ON sync_histories (action_name, state, sync_version_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Append a history row. Returns its id.
    pub async fn record(
        &self,
        action: SyncAction,
        state: SyncState,
        message: Option<&str>,
        version_id: u64,
    ) -> Result<i64> {
        let version = i64::try_from(version_id)
            .map_err(|_| SyncError::Internal(format!("change id {} out of range", version_id)))?;
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("history_record", || async move {
            sqlx::query(
                r#"
                INSERT INTO sync_histories
                    (action_name, state, message, sync_version_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(action.as_str())
            .bind(state.as_str())
            .bind(message)
            .bind(version)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(action = action.as_str(), state = state.as_str(), version_id, "Recorded sync history");
        Ok(result.last_insert_rowid())
    }

    /// Highest change id recorded for `action` in `state`.
    pub async fn last_version(&self, action: SyncAction, state: SyncState) -> Result<Option<u64>> {
        let pool = &self.pool;
        let row: Option<(Option<i64>,)> = execute_with_retry("history_last_version", || async move {
            sqlx::query_as(
                "SELECT MAX(sync_version_id) FROM sync_histories WHERE action_name = ? AND state = ?",
            )
            .bind(action.as_str())
            .bind(state.as_str())
            .fetch_optional(pool)
            .await
        })
        .await?;

        Ok(row
            .and_then(|(max,)| max)
            .and_then(|v| u64::try_from(v).ok()))
    }

    /// Most recent rows, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let pool = &self.pool;
        let rows = execute_with_retry("history_recent", || async move {
            sqlx::query_as::<_, HistoryEntry>(
                r#"
                SELECT id, action_name, state, message, sync_version_id, created_at, updated_at
                FROM sync_histories
                ORDER BY id DESC
                LIMIT ?
                "#,
            )
            .bind(i64::from(limit))
            .fetch_all(pool)
            .await
        })
        .await?;
        Ok(rows)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("history_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if self.path != IN_MEMORY {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!("Sync history store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_record_and_last_version() {
        let dir = tempdir().unwrap();
        let store = SyncHistoryStore::new(dir.path().join("history.db")).await.unwrap();

        assert_eq!(store.last_version(SyncAction::Export, SyncState::Success).await.unwrap(), None);

        store.record(SyncAction::Export, SyncState::Success, None, 10).await.unwrap();
        store.record(SyncAction::Export, SyncState::Success, None, 25).await.unwrap();
        store
            .record(SyncAction::Export, SyncState::Failure, Some("boom"), 99)
            .await
            .unwrap();
        store.record(SyncAction::Import, SyncState::Success, None, 40).await.unwrap();

        assert_eq!(
            store.last_version(SyncAction::Export, SyncState::Success).await.unwrap(),
            Some(25)
        );
        assert_eq!(
            store.last_version(SyncAction::Import, SyncState::Success).await.unwrap(),
            Some(40)
        );
        assert_eq!(store.last_version(SyncAction::Push, SyncState::Success).await.unwrap(), None);

        store.close().await;
    }

    #[tokio::test]
    async fn test_history_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("history.db");

        {
            let store = SyncHistoryStore::new(&db_path).await.unwrap();
            store.record(SyncAction::Push, SyncState::Success, None, 7).await.unwrap();
            store.close().await;
        }

        {
            let store = SyncHistoryStore::new(&db_path).await.unwrap();
            assert_eq!(
                store.last_version(SyncAction::Push, SyncState::Success).await.unwrap(),
                Some(7)
            );
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let store = SyncHistoryStore::open(&HistoryConfig::in_memory()).await.unwrap();
        store.record(SyncAction::Export, SyncState::Empty, None, 1).await.unwrap();
        store
            .record(SyncAction::Import, SyncState::Failure, Some("import failed"), 2)
            .await
            .unwrap();

        let rows = store.recent(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action_name, "import");
        assert_eq!(rows[0].state, "failure");
        assert_eq!(rows[0].message.as_deref(), Some("import failed"));
        assert_eq!(rows[1].state, "empty");
        assert!(rows[0].created_at > 0);

        assert_eq!(store.recent(1).await.unwrap().len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_version_out_of_range() {
        let store = SyncHistoryStore::open(&HistoryConfig::in_memory()).await.unwrap();
        let err = store
            .record(SyncAction::Export, SyncState::Success, None, u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
        store.close().await;
    }

    #[tokio::test]
    async fn test_checkpoint_on_file_store() {
        let dir = tempdir().unwrap();
        let store = SyncHistoryStore::new(dir.path().join("cp.db")).await.unwrap();
        store.record(SyncAction::Export, SyncState::Success, None, 1).await.unwrap();
        assert!(store.checkpoint().await.is_ok());
        assert!(store.path().ends_with("cp.db"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;
        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;
        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_other_errors() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
