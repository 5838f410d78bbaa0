// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Control files: the bucket lifecycle state machine.
//!
//! A control file's name *is* the bucket state:
//!
//! ```text
//! <exec_date:YYYYMMDD>-<status>-<retry_count>.ctl
//! ```
//!
//! # State Machine
//!
//! ```text
//!          pack (changes)           receive ok
//!   ──────────────────────▶ RDY ────────────────▶ IMP
//!                           │ ▲
//!            receive failed │ │ requeue (retry + 1)
//!                           ▼ │
//!                           ERR
//!
//!   pack (no changes) ────▶ END      push done: RDY ──▶ END (sender)
//! ```
//!
//! Every transition is a single `rename`, so exactly one control file exists
//! per bucket at any moment. Discovery is a sorted scan of the sync root; a
//! malformed name anywhere aborts the whole scan.

use super::packager::ControlBody;
use super::{write_locked, BucketId};
use crate::error::{Result, SyncError};
use crate::metrics;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Control file extension (without the dot).
pub const CONTROL_EXTENSION: &str = "ctl";

const DATE_FORMAT: &str = "%Y%m%d";

/// Bucket lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlStatus {
    /// Packed and waiting to be sent or imported.
    Ready,
    /// Imported by the receiver.
    Imported,
    /// Import failed; eligible for resend.
    Error,
    /// Finished: pushed by the sender, or nothing to send.
    End,
}

impl ControlStatus {
    pub const ALL: [ControlStatus; 4] = [
        ControlStatus::Ready,
        ControlStatus::Imported,
        ControlStatus::Error,
        ControlStatus::End,
    ];

    /// Three-letter code used in file names.
    pub fn code(&self) -> &'static str {
        match self {
            ControlStatus::Ready => "RDY",
            ControlStatus::Imported => "IMP",
            ControlStatus::Error => "ERR",
            ControlStatus::End => "END",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "RDY" => Some(ControlStatus::Ready),
            "IMP" => Some(ControlStatus::Imported),
            "ERR" => Some(ControlStatus::Error),
            "END" => Some(ControlStatus::End),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Parsed control file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlName {
    pub exec_date: NaiveDate,
    pub status: ControlStatus,
    pub retry_count: u32,
}

impl ControlName {
    pub fn new(exec_date: NaiveDate, status: ControlStatus) -> Self {
        Self {
            exec_date,
            status,
            retry_count: 0,
        }
    }

    /// Parse `<YYYYMMDD>-<STATUS>-<n>.ctl`.
    pub fn parse(file_name: &str) -> Result<Self> {
        let malformed = || SyncError::Protocol(format!("malformed control file name: {:?}", file_name));

        let stem = file_name
            .strip_suffix(CONTROL_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(malformed)?;

        let mut parts = stem.split('-');
        let (Some(date), Some(status), Some(retry), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let exec_date = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| malformed())?;
        let status = ControlStatus::from_code(status).ok_or_else(malformed)?;
        if retry.is_empty() || !retry.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let retry_count = retry.parse::<u32>().map_err(|_| malformed())?;

        Ok(Self {
            exec_date,
            status,
            retry_count,
        })
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-{}.{}",
            self.exec_date.format(DATE_FORMAT),
            self.status.code(),
            self.retry_count,
            CONTROL_EXTENSION
        )
    }

    /// Same date and retry count, new status.
    pub fn with_status(self, status: ControlStatus) -> Self {
        Self { status, ..self }
    }
}

/// A control file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFile {
    dir: PathBuf,
    bucket_id: BucketId,
    name: ControlName,
}

impl ControlFile {
    /// Write a new control file into `dir`.
    ///
    /// With a body the file holds the artifact's size and checksum; without
    /// one it is created empty (an `END` marker for an unchanged bucket).
    pub fn create(
        dir: &Path,
        bucket_id: BucketId,
        name: ControlName,
        body: Option<&ControlBody>,
    ) -> Result<Self> {
        let control = Self {
            dir: dir.to_path_buf(),
            bucket_id,
            name,
        };
        let content = body.map(ControlBody::render).unwrap_or_default();
        write_locked(&control.path(), content.as_bytes())?;
        metrics::record_transition(name.status.code());
        info!(control = %control.path().display(), "Created control file");
        Ok(control)
    }

    /// Describe an existing control file from its path.
    ///
    /// The parent directory name must be a numeric bucket id.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::Protocol(format!("invalid control file path: {}", path.display())))?;
        let name = ControlName::parse(file_name)?;

        let dir = path
            .parent()
            .ok_or_else(|| SyncError::Protocol(format!("control file has no bucket: {}", path.display())))?;
        let dir_name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::Protocol(format!("invalid bucket directory: {}", dir.display())))?;
        let bucket_id = BucketId::parse(dir_name)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            bucket_id,
            name,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(self.name.file_name())
    }

    /// Bucket directory holding this control file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    pub fn name(&self) -> ControlName {
        self.name
    }

    pub fn status(&self) -> ControlStatus {
        self.name.status
    }

    pub fn retry_count(&self) -> u32 {
        self.name.retry_count
    }

    pub fn file_name(&self) -> String {
        self.name.file_name()
    }

    /// Read the size/checksum body.
    pub fn read_body(&self) -> Result<ControlBody> {
        let path = self.path();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| SyncError::io(format!("read control file {}", path.display()), e))?;
        ControlBody::parse(&text)
    }

    /// Rename to a new status, preserving date and retry count.
    pub fn transition(self, to: ControlStatus) -> Result<Self> {
        let next = self.name.with_status(to);
        self.rename_to(next)
    }

    /// Move an `ERR` bucket back to `RDY`, bumping its retry count.
    pub fn requeue(self) -> Result<Self> {
        if self.name.status != ControlStatus::Error {
            return Err(SyncError::Protocol(format!(
                "only ERR buckets can be requeued, {} is {}",
                self.bucket_id, self.name.status
            )));
        }
        let next = ControlName {
            status: ControlStatus::Ready,
            retry_count: self.name.retry_count.saturating_add(1),
            ..self.name
        };
        self.rename_to(next)
    }

    fn rename_to(self, next: ControlName) -> Result<Self> {
        let from = self.path();
        let to = self.dir.join(next.file_name());
        std::fs::rename(&from, &to).map_err(|e| {
            SyncError::io(format!("rename {} to {}", from.display(), to.display()), e)
        })?;
        metrics::record_transition(next.status.code());
        info!(
            bucket_id = %self.bucket_id,
            from = %self.name.file_name(),
            to = %next.file_name(),
            "Control file transition"
        );
        Ok(Self { name: next, ..self })
    }
}

/// Find control files under `base_dir` whose status is in `statuses`.
///
/// Bucket directories are the entries whose name starts with a digit; other
/// entries (such as `work/`) are ignored. Every `.ctl` file in a bucket
/// directory is parsed, whatever its status, and the scan aborts on the first
/// malformed name, non-numeric bucket directory, or bucket holding more than
/// one control file. Results are in ascending bucket, then file name, order.
///
/// A missing `base_dir` yields no buckets.
pub fn scan(base_dir: &Path, statuses: &[ControlStatus]) -> Result<Vec<ControlFile>> {
    if !base_dir.exists() {
        debug!(base_dir = %base_dir.display(), "Sync root does not exist yet");
        return Ok(Vec::new());
    }

    let mut bucket_dirs = Vec::new();
    for entry in read_dir_sorted(base_dir)? {
        let starts_with_digit = entry
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.bytes().next())
            .is_some_and(|b| b.is_ascii_digit());
        if starts_with_digit && entry.is_dir() {
            bucket_dirs.push(entry);
        }
    }

    let mut found = Vec::new();
    for dir in bucket_dirs {
        let controls: Vec<PathBuf> = read_dir_sorted(&dir)?
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(CONTROL_EXTENSION))
            .collect();

        if controls.len() > 1 {
            return Err(SyncError::Protocol(format!(
                "bucket {} has {} control files",
                dir.display(),
                controls.len()
            )));
        }

        for path in controls {
            let control = ControlFile::from_path(&path)?;
            if statuses.contains(&control.status()) {
                found.push(control);
            } else {
                debug!(control = %path.display(), "Skipping control file with other status");
            }
        }
    }

    debug!(base_dir = %base_dir.display(), count = found.len(), "Scanned control files");
    Ok(found)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SyncError::io(format!("list {}", dir.display()), e))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SyncError::io(format!("list {}", dir.display()), e))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::bucket_dir;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 29).unwrap()
    }

    fn touch(base: &Path, bucket: &str, name: &str) -> PathBuf {
        let dir = base.join(bucket);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for status in ControlStatus::ALL {
            assert_eq!(ControlStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(ControlStatus::from_code("rdy"), None);
    }

    #[test]
    fn test_parse_control_name() {
        let name = ControlName::parse("20241029-ERR-3.ctl").unwrap();
        assert_eq!(name.exec_date, date());
        assert_eq!(name.status, ControlStatus::Error);
        assert_eq!(name.retry_count, 3);
        assert_eq!(name.file_name(), "20241029-ERR-3.ctl");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        for bad in [
            "20241029-RDY-0.txt",
            "20241029-RDY.ctl",
            "20241029-XXX-0.ctl",
            "2024102-RDY-0.ctl",
            "20241329-RDY-0.ctl",
            "20241029-RDY--1.ctl",
            "20241029-RDY-a.ctl",
            "20241029-RDY-0-1.ctl",
            "20241029-rdy-0.ctl",
            ".ctl",
            "",
        ] {
            assert!(
                matches!(ControlName::parse(bad), Err(SyncError::Protocol(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_transition_is_rename() {
        let base = TempDir::new().unwrap();
        let dir = bucket_dir(base.path(), BucketId(1));
        std::fs::create_dir_all(&dir).unwrap();

        let control = ControlFile::create(
            &dir,
            BucketId(1),
            ControlName::new(date(), ControlStatus::Ready),
            Some(&ControlBody {
                size: 10,
                checksum: "ab".to_string(),
            }),
        )
        .unwrap();
        let old_path = control.path();

        let control = control.transition(ControlStatus::Imported).unwrap();
        assert!(!old_path.exists());
        assert_eq!(control.file_name(), "20241029-IMP-0.ctl");
        // Body travels with the rename.
        assert_eq!(control.read_body().unwrap().size, 10);

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_requeue_bumps_retry_count() {
        let base = TempDir::new().unwrap();
        let path = touch(base.path(), "00000000000001", "20241029-ERR-2.ctl");
        let control = ControlFile::from_path(&path).unwrap();

        let control = control.requeue().unwrap();
        assert_eq!(control.status(), ControlStatus::Ready);
        assert_eq!(control.retry_count(), 3);
        assert!(control.path().exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_requeue_rejects_non_error() {
        let base = TempDir::new().unwrap();
        let path = touch(base.path(), "00000000000001", "20241029-RDY-0.ctl");
        let control = ControlFile::from_path(&path).unwrap();
        assert!(matches!(control.requeue(), Err(SyncError::Protocol(_))));
        assert!(path.exists());
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let base = TempDir::new().unwrap();
        touch(base.path(), "00000000000003", "20241029-RDY-0.ctl");
        touch(base.path(), "00000000000001", "20241028-ERR-1.ctl");
        touch(base.path(), "00000000000002", "20241028-END-0.ctl");
        touch(base.path(), "00000000000004", "20241029-IMP-0.ctl");
        std::fs::create_dir_all(base.path().join("work")).unwrap();

        let sendable = scan(base.path(), &[ControlStatus::Ready, ControlStatus::Error]).unwrap();
        let ids: Vec<u64> = sendable.iter().map(|c| c.bucket_id().value()).collect();
        assert_eq!(ids, vec![1, 3]);

        let ready = scan(base.path(), &[ControlStatus::Ready]).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].bucket_id(), BucketId(3));
    }

    #[test]
    fn test_scan_aborts_on_malformed_name() {
        let base = TempDir::new().unwrap();
        touch(base.path(), "00000000000001", "20241029-RDY-0.ctl");
        touch(base.path(), "00000000000002", "garbage.ctl");
        touch(base.path(), "00000000000003", "20241029-RDY-0.ctl");

        assert!(matches!(
            scan(base.path(), &[ControlStatus::Ready]),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_scan_aborts_on_non_numeric_bucket() {
        let base = TempDir::new().unwrap();
        touch(base.path(), "12x", "20241029-RDY-0.ctl");
        assert!(matches!(
            scan(base.path(), &[ControlStatus::Ready]),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_scan_rejects_duplicate_control_files() {
        let base = TempDir::new().unwrap();
        touch(base.path(), "00000000000001", "20241029-RDY-0.ctl");
        touch(base.path(), "00000000000001", "20241029-ERR-0.ctl");
        assert!(matches!(
            scan(base.path(), &[ControlStatus::Ready]),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn test_scan_missing_root_is_empty() {
        let base = TempDir::new().unwrap();
        assert!(scan(&base.path().join("absent"), &[ControlStatus::Ready])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_from_path_requires_numeric_bucket() {
        let base = TempDir::new().unwrap();
        let path = touch(base.path(), "work", "20241029-IMP-0.ctl");
        assert!(matches!(
            ControlFile::from_path(&path),
            Err(SyncError::Protocol(_))
        ));
    }
}
