// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bucket packaging: change-set ⇄ compressed, integrity-checked artifact.
//!
//! # Pack
//!
//! 1. Serialize the change-set to the payload file (locked write)
//! 2. Gzip at maximum level; the member header carries the payload's file
//!    name and modification time
//! 3. Hash and measure the *compressed* artifact
//! 4. Write `<size>\n<checksum>\n` into a fresh `RDY` control file
//!
//! An empty change-set skips 1-3 and leaves an empty `END` control file.
//!
//! # Unpack
//!
//! Size and checksum are compared against the control file before a single
//! byte is decompressed. Any mismatch is an integrity error and nothing is
//! written. On success the payload is restored with its original mtime.
//!
//! Everything here is blocking file I/O plus compression; async callers run it
//! on the blocking pool.

use super::control::{ControlFile, ControlName, ControlStatus, CONTROL_EXTENSION};
use super::{ensure_dir, open_locked, write_locked, BucketId, ARTIFACT_FILE, PAYLOAD_FILE};
use crate::change::ChangeSet;
use crate::error::{Result, SyncError};
use crate::metrics;
use chrono::NaiveDate;
use filetime::FileTime;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Two-line control file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlBody {
    /// Compressed artifact size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the compressed artifact.
    pub checksum: String,
}

impl ControlBody {
    /// Parse a control file body. Lines after the second are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));

        let size = lines.next().unwrap_or_default();
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SyncError::Protocol(format!(
                "control file size field is not numeric: {:?}",
                size
            )));
        }
        let size = size
            .parse::<u64>()
            .map_err(|e| SyncError::Protocol(format!("control file size field {:?}: {}", size, e)))?;

        let checksum = lines.next().unwrap_or_default().trim();
        if checksum.is_empty() {
            return Err(SyncError::Protocol(
                "control file has no checksum line".to_string(),
            ));
        }

        Ok(Self {
            size,
            checksum: checksum.to_string(),
        })
    }

    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.size, self.checksum)
    }
}

/// A packed bucket ready to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketArtifact {
    pub bucket_id: BucketId,
    pub payload_path: PathBuf,
    pub artifact_path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub control: ControlFile,
}

/// Files of a packed bucket in upload order.
///
/// The artifact goes first: the control file's presence tells the other side
/// the bucket is complete.
pub fn push_order(control: &ControlFile) -> Vec<PathBuf> {
    vec![control.dir().join(ARTIFACT_FILE), control.path()]
}

/// Result of [`pack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packed {
    /// Changes were packaged; the bucket is `RDY`.
    Ready(BucketArtifact),
    /// Nothing changed; the bucket went straight to `END`.
    Unchanged(ControlFile),
}

impl Packed {
    pub fn control(&self) -> &ControlFile {
        match self {
            Packed::Ready(artifact) => &artifact.control,
            Packed::Unchanged(control) => control,
        }
    }
}

/// Package a change-set into `dir`.
///
/// `dir` must not already hold a bucket: an existing control file or
/// artifact fails with [`SyncError::Protocol`] and nothing is written.
pub fn pack(dir: &Path, bucket_id: BucketId, changeset: &ChangeSet, exec_date: NaiveDate) -> Result<Packed> {
    ensure_dir(dir)?;
    ensure_unused(dir, bucket_id)?;

    if changeset.is_empty() {
        let control = ControlFile::create(
            dir,
            bucket_id,
            ControlName::new(exec_date, ControlStatus::End),
            None,
        )?;
        info!(bucket_id = %bucket_id, since = changeset.since, "No changes, bucket finished");
        return Ok(Packed::Unchanged(control));
    }

    let payload_path = dir.join(PAYLOAD_FILE);
    let payload = serde_json::to_vec(changeset)?;
    write_locked(&payload_path, &payload)?;

    let mtime = file_mtime_secs(&payload_path)?;
    let artifact_path = dir.join(ARTIFACT_FILE);
    compress_to(&artifact_path, &payload, mtime)?;

    let size = std::fs::metadata(&artifact_path)
        .map_err(|e| SyncError::io(format!("stat {}", artifact_path.display()), e))?
        .len();
    let checksum = compute_checksum(&artifact_path)?;
    let body = ControlBody {
        size,
        checksum: checksum.clone(),
    };

    let control = ControlFile::create(
        dir,
        bucket_id,
        ControlName::new(exec_date, ControlStatus::Ready),
        Some(&body),
    )?;

    metrics::record_bucket_packed(size);
    info!(
        bucket_id = %bucket_id,
        records = changeset.len(),
        payload_bytes = payload.len(),
        compressed_bytes = size,
        "Packed bucket"
    );

    Ok(Packed::Ready(BucketArtifact {
        bucket_id,
        payload_path,
        artifact_path,
        size,
        checksum,
        control,
    }))
}

fn ensure_unused(dir: &Path, bucket_id: BucketId) -> Result<()> {
    if dir.join(ARTIFACT_FILE).exists() {
        return Err(SyncError::Protocol(format!(
            "bucket {} already packed in {}",
            bucket_id,
            dir.display()
        )));
    }
    let entries = std::fs::read_dir(dir).map_err(|e| SyncError::io(format!("list {}", dir.display()), e))?;
    for entry in entries {
        let path = entry
            .map_err(|e| SyncError::io(format!("list {}", dir.display()), e))?
            .path();
        if path.extension().and_then(|e| e.to_str()) == Some(CONTROL_EXTENSION) {
            warn!(bucket_id = %bucket_id, control = %path.display(), "Bucket already exists");
            return Err(SyncError::Protocol(format!(
                "bucket {} already has control file {}",
                bucket_id,
                path.display()
            )));
        }
    }
    Ok(())
}

/// Verify and unpack the bucket behind a control file.
pub fn unpack(control: &ControlFile) -> Result<ChangeSet> {
    let body = control.read_body()?;
    let artifact_path = control.dir().join(ARTIFACT_FILE);

    let actual_size = std::fs::metadata(&artifact_path)
        .map_err(|e| SyncError::io(format!("stat {}", artifact_path.display()), e))?
        .len();
    if actual_size != body.size {
        metrics::record_integrity_failure("size");
        warn!(control = %control.file_name(), expected = body.size, actual = actual_size, "Unmatched file size");
        return Err(SyncError::SizeMismatch {
            control: control.path().display().to_string(),
            expected: body.size,
            actual: actual_size,
        });
    }

    let actual_checksum = compute_checksum(&artifact_path)?;
    if !actual_checksum.eq_ignore_ascii_case(&body.checksum) {
        metrics::record_integrity_failure("checksum");
        warn!(control = %control.file_name(), expected = %body.checksum, actual = %actual_checksum, "Unmatched checksum");
        return Err(SyncError::ChecksumMismatch {
            control: control.path().display().to_string(),
            expected: body.checksum,
            actual: actual_checksum,
        });
    }

    let compressed = std::fs::read(&artifact_path)
        .map_err(|e| SyncError::io(format!("read {}", artifact_path.display()), e))?;
    let (payload, mtime) = decompress(&compressed)?;

    let payload_path = control.dir().join(PAYLOAD_FILE);
    write_locked(&payload_path, &payload)?;
    if let Some(secs) = mtime {
        filetime::set_file_mtime(&payload_path, FileTime::from_unix_time(i64::from(secs), 0))
            .map_err(|e| SyncError::io(format!("set mtime on {}", payload_path.display()), e))?;
    }

    let changeset: ChangeSet = serde_json::from_slice(&payload)?;
    debug!(
        bucket_id = %control.bucket_id(),
        records = changeset.len(),
        "Unpacked bucket"
    );
    Ok(changeset)
}

/// Gunzip a complete artifact.
///
/// Returns the payload and the member's embedded modification time (`None`
/// when the header carries none).
pub fn decompress(compressed: &[u8]) -> Result<(Vec<u8>, Option<u32>)> {
    let mut decoder = GzDecoder::new(compressed);
    let mut payload = Vec::new();
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| SyncError::Decompression(e.to_string()))?;
    let mtime = decoder
        .header()
        .map(|h| h.mtime())
        .filter(|&secs| secs != 0);
    Ok((payload, mtime))
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| SyncError::io(format!("open {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| SyncError::io(format!("hash {}", path.display()), e))?;
    Ok(hex::encode(hasher.finalize()))
}

fn compress_to(path: &Path, payload: &[u8], mtime: u32) -> Result<()> {
    let file = open_locked(path)?;
    let mut encoder = GzBuilder::new()
        .filename(PAYLOAD_FILE)
        .mtime(mtime)
        .write(file, Compression::best());
    encoder
        .write_all(payload)
        .map_err(|e| SyncError::io(format!("compress into {}", path.display()), e))?;
    let file = encoder
        .finish()
        .map_err(|e| SyncError::io(format!("finish {}", path.display()), e))?;
    file.sync_all()
        .map_err(|e| SyncError::io(format!("sync {}", path.display()), e))
}

fn file_mtime_secs(path: &Path) -> Result<u32> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| SyncError::io(format!("stat {}", path.display()), e))?;
    // Gzip stores a 32-bit timestamp; pre-epoch or far-future times are dropped.
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u32::try_from(d.as_secs()).ok())
        .unwrap_or(0))
}
