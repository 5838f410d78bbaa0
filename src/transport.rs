// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Moving buckets between hosts.
//!
//! Two implementations of [`Transport`]:
//!
//! | Transport | Remote root | Use |
//! |-----------|-------------|-----|
//! | [`DirectoryTransport`] | a local or mounted directory | shared storage, tests |
//! | [`FtpTransport`] | an FTP endpoint from [`TransportConfig`] | production |
//!
//! Operations are blocking, with no timeout or retry: a failure aborts the
//! current step. Async callers run them on the blocking pool.
//!
//! Upload order matters. The control file's presence tells the other side a
//! bucket is complete, so it always goes last. A control file already in the
//! remote bucket (from an earlier, failed delivery) is removed just before the
//! new one is uploaded, keeping one control file per bucket.

use crate::bucket::control::CONTROL_EXTENSION;
use crate::bucket::packager::push_order;
use crate::bucket::{self, write_locked, BucketId, ControlFile, ControlName, ControlStatus, RESULT_FILE};
use crate::config::TransportConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use std::path::{Path, PathBuf};
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, info};

/// A remote bucket store.
///
/// Remote paths are relative to the remote sync root and use `/` separators,
/// e.g. `00000000000042/20241029-IMP-0.ctl`.
pub trait Transport: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Ensure the remote bucket directory exists and upload `files` into it,
    /// in the given order. Uploading a control file replaces any other control
    /// file in the remote bucket.
    fn push(&self, bucket_id: BucketId, files: &[PathBuf]) -> Result<()>;

    /// Recursively list the remote root. Sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Fetch one remote file.
    fn fetch(&self, remote_path: &str) -> Result<Vec<u8>>;
}

/// Push a packed bucket: artifact first, then its control file.
pub fn push_bucket<T: Transport + ?Sized>(transport: &T, control: &ControlFile) -> Result<()> {
    let files = push_order(control);
    info!(
        transport = transport.name(),
        bucket_id = %control.bucket_id(),
        control = %control.file_name(),
        "Pushing bucket"
    );
    let result = transport.push(control.bucket_id(), &files);
    metrics::record_push(result.is_ok(), files.len());
    result
}

/// Download the result file of the newest imported bucket into `work_dir`.
///
/// Picks the lexicographically last `<bucket>/<date>-IMP-<n>.ctl` on the
/// remote. Returns `None` when nothing has been imported yet.
pub fn pull_latest_status<T: Transport + ?Sized>(transport: &T, work_dir: &Path) -> Result<Option<PathBuf>> {
    let latest = transport
        .list()?
        .into_iter()
        .filter(|path| is_imported_control(path))
        .max();

    let Some(control_path) = latest else {
        info!(transport = transport.name(), "No imported bucket on remote, no status file");
        return Ok(None);
    };

    let bucket = control_path
        .split_once('/')
        .map(|(bucket, _)| bucket)
        .ok_or_else(|| SyncError::Internal(format!("unexpected remote path {}", control_path)))?;
    let remote = format!("{}/{}", bucket, RESULT_FILE);
    let local = work_dir.join(RESULT_FILE);

    info!(remote = %remote, local = %local.display(), "Pulling status file");
    let bytes = transport.fetch(&remote)?;
    bucket::ensure_dir(work_dir)?;
    write_locked(&local, &bytes)?;
    Ok(Some(local))
}

fn is_control_file(name: &str) -> bool {
    Path::new(name).extension().and_then(|e| e.to_str()) == Some(CONTROL_EXTENSION)
}

/// `<digits>/<valid IMP control name>`
fn is_imported_control(path: &str) -> bool {
    let Some((bucket, name)) = path.split_once('/') else {
        return false;
    };
    BucketId::parse(bucket).is_ok()
        && ControlName::parse(name).is_ok_and(|n| n.status == ControlStatus::Imported)
}

// ═══════════════════════════════════════════════════════════════════════════════
// DirectoryTransport
// ═══════════════════════════════════════════════════════════════════════════════

/// Transport over a directory tree (local disk or a mounted share).
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    root: PathBuf,
}

impl DirectoryTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn remove_stale_controls(&self, remote_dir: &Path, keep: &std::ffi::OsStr) -> Result<()> {
        let entries = std::fs::read_dir(remote_dir)
            .map_err(|e| SyncError::transport("list", format!("{}: {}", remote_dir.display(), e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::transport("list", e))?;
            let name = entry.file_name();
            if name != keep && is_control_file(&name.to_string_lossy()) {
                std::fs::remove_file(entry.path())
                    .map_err(|e| SyncError::transport("delete", format!("{}: {}", entry.path().display(), e)))?;
                debug!(file = %entry.path().display(), "Removed stale control file");
            }
        }
        Ok(())
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SyncError::transport("list", format!("{}: {}", dir.display(), e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| SyncError::transport("list", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // Partial uploads are invisible.
            if name.ends_with(".part") {
                continue;
            }
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path, &relative, out)?;
            } else {
                out.push(relative);
            }
        }
        Ok(())
    }
}

impl Transport for DirectoryTransport {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn push(&self, bucket_id: BucketId, files: &[PathBuf]) -> Result<()> {
        let remote_dir = bucket::bucket_dir(&self.root, bucket_id);
        std::fs::create_dir_all(&remote_dir)
            .map_err(|e| SyncError::transport("mkdir", format!("{}: {}", remote_dir.display(), e)))?;

        for file in files {
            let name = file
                .file_name()
                .ok_or_else(|| SyncError::InvalidArgument(format!("not a file: {}", file.display())))?;
            let target = remote_dir.join(name);
            let partial = remote_dir.join(format!("{}.part", name.to_string_lossy()));

            if is_control_file(&name.to_string_lossy()) {
                self.remove_stale_controls(&remote_dir, name)?;
            }

            std::fs::copy(file, &partial)
                .and_then(|_| std::fs::rename(&partial, &target))
                .map_err(|e| SyncError::transport("put", format!("{}: {}", target.display(), e)))?;
            debug!(file = %target.display(), "Pushed file");
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if self.root.exists() {
            self.walk(&self.root, "", &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    fn fetch(&self, remote_path: &str) -> Result<Vec<u8>> {
        let path = self.root.join(remote_path);
        std::fs::read(&path)
            .map_err(|e| SyncError::transport("get", format!("{}: {}", path.display(), e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FtpTransport
// ═══════════════════════════════════════════════════════════════════════════════

/// Transport over FTP. One control connection per operation.
#[derive(Debug, Clone)]
pub struct FtpTransport {
    config: TransportConfig,
}

impl FtpTransport {
    /// Validate the endpoint and build the transport.
    pub fn new(config: TransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn connect(&self) -> Result<FtpStream> {
        let address = self.config.address();
        debug!(site = %address, user = %self.config.user, passive = self.config.passive, "FTP connect");

        let mut ftp = FtpStream::connect(address.as_str()).map_err(|e| SyncError::transport("connect", e))?;
        ftp.login(self.config.user.as_str(), self.config.password.as_str())
            .map_err(|e| SyncError::transport("login", e))?;
        ftp.set_mode(if self.config.passive {
            Mode::Passive
        } else {
            Mode::Active
        });
        ftp.transfer_type(FileType::Binary)
            .map_err(|e| SyncError::transport("type", e))?;
        if !self.config.directory.is_empty() {
            ftp.cwd(self.config.directory.as_str())
                .map_err(|e| SyncError::transport("cwd", format!("{}: {}", self.config.directory, e)))?;
        }
        Ok(ftp)
    }
}

impl Transport for FtpTransport {
    fn name(&self) -> &'static str {
        "ftp"
    }

    fn push(&self, bucket_id: BucketId, files: &[PathBuf]) -> Result<()> {
        let mut ftp = self.connect()?;
        let bucket = bucket_id.to_string();

        if ftp.cwd(bucket.as_str()).is_err() {
            debug!(bucket = %bucket, "Creating remote bucket directory");
            ftp.mkdir(bucket.as_str())
                .map_err(|e| SyncError::transport("mkdir", format!("{}: {}", bucket, e)))?;
            ftp.cwd(bucket.as_str())
                .map_err(|e| SyncError::transport("cwd", format!("{}: {}", bucket, e)))?;
        }

        for file in files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| SyncError::InvalidArgument(format!("not a file: {}", file.display())))?;
            if is_control_file(name) {
                let existing = ftp
                    .nlst(None)
                    .map_err(|e| SyncError::transport("nlst", format!("{}: {}", bucket, e)))?;
                for stale in existing {
                    let stale = stale.rsplit('/').next().unwrap_or(&stale).to_string();
                    if stale != name && is_control_file(&stale) {
                        ftp.rm(stale.as_str())
                            .map_err(|e| SyncError::transport("delete", format!("{}/{}: {}", bucket, stale, e)))?;
                        debug!(file = %stale, "Removed stale control file");
                    }
                }
            }
            let mut reader = std::fs::File::open(file)
                .map_err(|e| SyncError::io(format!("open {}", file.display()), e))?;
            let sent = ftp
                .put_file(name, &mut reader)
                .map_err(|e| SyncError::transport("put", format!("{}/{}: {}", bucket, name, e)))?;
            debug!(file = %name, bytes = sent, "Pushed file");
        }

        // The upload is complete; a failed QUIT is not worth failing the push.
        let _ = ftp.quit();
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ftp = self.connect()?;
        let top = ftp.nlst(None).map_err(|e| SyncError::transport("nlst", e))?;

        let mut out = Vec::new();
        for entry in top {
            let entry = entry.trim_start_matches("./").to_string();
            if !entry.bytes().next().is_some_and(|b| b.is_ascii_digit()) {
                out.push(entry);
                continue;
            }
            let children = ftp
                .nlst(Some(entry.as_str()))
                .map_err(|e| SyncError::transport("nlst", format!("{}: {}", entry, e)))?;
            for child in children {
                // Servers differ on whether NLST returns bare names or paths.
                let child = child.trim_start_matches("./");
                let name = child.rsplit('/').next().unwrap_or(child);
                out.push(format!("{}/{}", entry, name));
            }
        }

        let _ = ftp.quit();
        out.sort();
        Ok(out)
    }

    fn fetch(&self, remote_path: &str) -> Result<Vec<u8>> {
        let mut ftp = self.connect()?;
        let buffer = ftp
            .retr_as_buffer(remote_path)
            .map_err(|e| SyncError::transport("get", format!("{}: {}", remote_path, e)))?;
        let _ = ftp.quit();
        Ok(buffer.into_inner())
    }
}
