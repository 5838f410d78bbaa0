// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bucket layout and locked file I/O.
//!
//! A bucket is one transfer unit: a directory named by its zero-padded id
//! under a sync root, holding the payload, the compressed artifact, exactly
//! one control file, and (on the receiver) the import result file.
//!
//! ```text
//! <base_dir>/
//! ├── 00000000000042/
//! │   ├── changeset.json          # payload (sender) / restored payload (receiver)
//! │   ├── changeset.json.gz       # compressed artifact
//! │   ├── 20241029-RDY-0.ctl      # control file: name is the state
//! │   └── status.json             # import result (receiver only)
//! └── work/
//!     └── status.json             # latest result pulled back by the sender
//! ```
//!
//! Zero padding keeps lexicographic and numeric bucket order identical, which
//! the discovery scan and the status pull both rely on.
//!
//! Every artifact write takes an exclusive, non-blocking advisory lock on the
//! target file. Failing to get it is fatal: we never wait.

pub mod control;
pub mod packager;

pub use control::{ControlFile, ControlName, ControlStatus};
pub use packager::{BucketArtifact, ControlBody};

use crate::change::ImportOutcome;
use crate::error::{Result, SyncError};
use crate::metrics;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Serialized change-set inside a bucket.
pub const PAYLOAD_FILE: &str = "changeset.json";
/// Gzip-compressed payload.
pub const ARTIFACT_FILE: &str = "changeset.json.gz";
/// Serialized [`ImportOutcome`] written by the receiver.
pub const RESULT_FILE: &str = "status.json";
/// Sender-side directory receiving the pulled result file.
pub const WORK_DIR: &str = "work";

/// Width of a bucket directory name.
pub const BUCKET_ID_WIDTH: usize = 14;

/// Bucket identifier. Rendered zero-padded to [`BUCKET_ID_WIDTH`] digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketId(pub u64);

impl BucketId {
    /// Parse a bucket directory name. Only ASCII digits are accepted.
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::Protocol(format!(
                "bucket directory name is not numeric: {:?}",
                name
            )));
        }
        name.parse::<u64>()
            .map(BucketId)
            .map_err(|e| SyncError::Protocol(format!("bucket id {:?} out of range: {}", name, e)))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:0width$}", self.0, width = BUCKET_ID_WIDTH)
    }
}

impl From<u64> for BucketId {
    fn from(id: u64) -> Self {
        BucketId(id)
    }
}

/// Directory of a bucket under a sync root.
pub fn bucket_dir(base_dir: &Path, bucket_id: BucketId) -> PathBuf {
    base_dir.join(bucket_id.to_string())
}

/// Create a directory and its parents.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| SyncError::io(format!("create directory {}", dir.display()), e))
}

/// Open `path` for writing under an exclusive non-blocking lock.
///
/// The file is truncated only after the lock is held, so a contending writer
/// never clobbers the lock holder's content. The lock is released when the
/// returned handle is dropped.
pub fn open_locked(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| SyncError::io(format!("open {}", path.display()), e))?;

    if file.try_lock_exclusive().is_err() {
        metrics::record_lock_contention();
        return Err(SyncError::LockContention {
            path: path.display().to_string(),
        });
    }

    file.set_len(0)
        .map_err(|e| SyncError::io(format!("truncate {}", path.display()), e))?;
    debug!(path = %path.display(), "Acquired exclusive lock");
    Ok(file)
}

/// Write `bytes` to `path` under an exclusive non-blocking lock.
pub fn write_locked(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = open_locked(path)?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| SyncError::io(format!("write {}", path.display()), e))
}

/// Write an import outcome as the bucket's result file.
pub fn write_result_file(dir: &Path, outcome: &ImportOutcome) -> Result<PathBuf> {
    let path = dir.join(RESULT_FILE);
    let json = serde_json::to_vec_pretty(outcome)?;
    write_locked(&path, &json)?;
    debug!(path = %path.display(), success = outcome.success, "Wrote result file");
    Ok(path)
}

/// Read an import outcome from a result file.
pub fn read_result_file(path: &Path) -> Result<ImportOutcome> {
    let bytes = std::fs::read(path)
        .map_err(|e| SyncError::io(format!("read result file {}", path.display()), e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn outcome() -> ImportOutcome {
        ImportOutcome {
            success: true,
            last_event_id: Some(12),
            last_event_time: None,
            failed_event_id: None,
            failed_event_time: None,
            failed_event: None,
            exception: None,
        }
    }

    #[test]
    fn test_bucket_id_display_is_zero_padded() {
        assert_eq!(BucketId(42).to_string(), "00000000000042");
        assert_eq!(BucketId(42).to_string().len(), BUCKET_ID_WIDTH);
    }

    #[test]
    fn test_bucket_id_ordering_matches_names() {
        let mut ids = vec![BucketId(100), BucketId(9), BucketId(20)];
        let mut names: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        ids.sort();
        names.sort();
        let rendered: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(rendered, names);
    }

    #[test]
    fn test_bucket_id_parse() {
        assert_eq!(BucketId::parse("00000000000042").unwrap(), BucketId(42));
        assert_eq!(BucketId::parse("7").unwrap(), BucketId(7));
        assert!(matches!(BucketId::parse("work"), Err(SyncError::Protocol(_))));
        assert!(matches!(BucketId::parse("12a"), Err(SyncError::Protocol(_))));
        assert!(matches!(BucketId::parse(""), Err(SyncError::Protocol(_))));
        assert!(matches!(
            BucketId::parse("99999999999999999999999"),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_write_locked_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file");
        write_locked(&path, b"a longer first version").unwrap();
        write_locked(&path, b"short").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn test_write_locked_fails_fast_under_contention() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PAYLOAD_FILE);
        std::fs::write(&path, b"held").unwrap();

        let holder = File::open(&path).unwrap();
        holder.lock_exclusive().unwrap();

        let err = write_locked(&path, b"intruder").unwrap_err();
        assert!(matches!(err, SyncError::LockContention { .. }));
        // Holder's content survives.
        assert_eq!(std::fs::read(&path).unwrap(), b"held");

        holder.unlock().unwrap();
        write_locked(&path, b"after").unwrap();
    }

    #[test]
    fn test_result_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = write_result_file(dir.path(), &outcome()).unwrap();
        assert_eq!(path.file_name().unwrap(), RESULT_FILE);
        assert_eq!(read_result_file(&path).unwrap(), outcome());
    }

    #[test]
    fn test_read_result_file_missing() {
        let dir = TempDir::new().unwrap();
        let err = read_result_file(&dir.path().join(RESULT_FILE)).unwrap_err();
        assert!(matches!(err, SyncError::Io { .. }));
    }

    #[test]
    fn test_read_result_file_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RESULT_FILE);
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            read_result_file(&path),
            Err(SyncError::Serialization(_))
        ));
    }
}
