// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestration.
//!
//! Sequences export, packaging, transport and replay for one scheduled run
//! on either side of the mirror:
//!
//! ```text
//! sender (master)                                   receiver (slave)
//! ───────────────                                   ────────────────
//! pull_status()  ◄── <bucket>/status.json ───────── (written by receive)
//! send()
//!   resolve cursor
//!   export → pack ──► <bucket>/<date>-RDY-0.ctl
//!   scan RDY|ERR
//!   push ────────────── changeset.json.gz, .ctl ──► <bucket>/...-RDY-n.ctl
//!   rename → END                                    receive()
//!                                                     scan RDY
//!                                                     unpack (size, checksum)
//!                                                     replay → status.json
//!                                                     rename → IMP | ERR
//! ```
//!
//! # Failure handling
//!
//! Every fatal error is logged, counted, and handed to the [`Notifier`]
//! before it is returned. Control files only move after the step they
//! describe has succeeded, so the next run retries the same bucket:
//!
//! | Failure | Control file | Result file |
//! |---------|--------------|-------------|
//! | configuration | untouched (nothing is read) | none |
//! | size/checksum mismatch, malformed name | untouched | none |
//! | push failure | stays `RDY` on the sender | none |
//! | replay failure | `ERR` on the receiver | written, with the resume point |
//!
//! Blocking work (filesystem, gzip, transport) runs on the blocking pool.

mod types;

pub use types::{BucketImport, ReceiveReport, RunContext, SendReport};

use crate::bucket::packager::{self, Packed};
use crate::bucket::{self, BucketId, ControlFile, ControlStatus};
use crate::change::CursorSource;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::export::DiffExporter;
use crate::history::{SyncAction, SyncHistoryStore, SyncState};
use crate::metrics;
use crate::replay::ReplayImporter;
use crate::store::{ChangeStore, ReplayTarget};
use crate::transport::{self, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// External channel for fatal errors (operator email, pager, ...).
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, ctx: &RunContext, error: &SyncError);
}

/// Notifier that only logs. Used when no channel is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, ctx: &RunContext, error: &SyncError) {
        error!(
            action = ctx.action,
            bucket_id = %ctx.bucket_label(),
            category = %error.category(),
            error = %error,
            "Sync failure notification"
        );
    }
}

/// Runs sender and receiver cycles.
pub struct SyncOrchestrator<T: Transport, N: Notifier = LogNotifier> {
    config: SyncConfig,
    transport: Arc<T>,
    notifier: Arc<N>,
    history: Option<Arc<SyncHistoryStore>>,
}

impl<T: Transport> SyncOrchestrator<T, LogNotifier> {
    pub fn new(config: SyncConfig, transport: Arc<T>) -> Self {
        Self::with_notifier(config, transport, Arc::new(LogNotifier))
    }
}

impl<T: Transport, N: Notifier> SyncOrchestrator<T, N> {
    pub fn with_notifier(config: SyncConfig, transport: Arc<T>, notifier: Arc<N>) -> Self {
        Self {
            config,
            transport,
            notifier,
            history: None,
        }
    }

    /// Record one history row per export, push and import.
    pub fn with_history(mut self, history: Arc<SyncHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn history(&self) -> Option<&Arc<SyncHistoryStore>> {
        self.history.as_ref()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Sender
    // ═══════════════════════════════════════════════════════════════════════════

    /// Download the newest result file from the remote into the sender's
    /// work directory. `None` when nothing has been imported yet.
    pub async fn pull_status(&self) -> Result<Option<PathBuf>> {
        let ctx = RunContext::new("pull_status");
        let started = Instant::now();
        let result = self.pull_status_inner().instrument(ctx.span()).await;
        self.finish(&ctx, started, result)
    }

    async fn pull_status_inner(&self) -> Result<Option<PathBuf>> {
        self.config.validate()?;
        let transport = Arc::clone(&self.transport);
        let work_dir = self.config.master.work_dir();
        run_blocking(move || transport::pull_latest_status(transport.as_ref(), &work_dir)).await
    }

    /// Export everything after the cursor into bucket `bucket_id`, then push
    /// every sendable bucket.
    ///
    /// Buckets in `ERR` are requeued (`RDY`, retry count + 1) and resent.
    /// A pushed bucket moves to `END`.
    pub async fn send<S: ChangeStore>(
        &self,
        exporter: &DiffExporter<S>,
        bucket_id: BucketId,
        cursor: CursorSource,
    ) -> Result<SendReport> {
        let ctx = RunContext::new("send").with_bucket(bucket_id);
        let started = Instant::now();
        let result = self
            .send_inner(exporter, bucket_id, cursor)
            .instrument(ctx.span())
            .await;
        self.finish(&ctx, started, result)
    }

    async fn send_inner<S: ChangeStore>(
        &self,
        exporter: &DiffExporter<S>,
        bucket_id: BucketId,
        cursor: CursorSource,
    ) -> Result<SendReport> {
        // Configuration problems abort before any file is touched.
        self.config.validate()?;

        let since = cursor.resolve()?;
        info!(since, "Exporting changes");
        let changeset = exporter.export(Some(since)).await?;
        let records = changeset.len();
        let version = changeset.last_id().unwrap_or(since);

        let dir = bucket::bucket_dir(&self.config.master.base_dir, bucket_id);
        let exec_date = chrono::Local::now().date_naive();
        let packed = run_blocking(move || packager::pack(&dir, bucket_id, &changeset, exec_date)).await?;

        let packed_status = packed.control().status();
        match &packed {
            Packed::Ready(artifact) => {
                info!(records, size = artifact.size, checksum = %artifact.checksum, "Bucket packed");
                self.record_history(SyncAction::Export, SyncState::Success, None, version)
                    .await;
            }
            Packed::Unchanged(control) => {
                info!(control = %control.file_name(), "No changes since cursor, bucket closed");
                self.record_history(SyncAction::Export, SyncState::Empty, None, version)
                    .await;
            }
        }

        let pushed = self.push_pending().await?;
        if !pushed.is_empty() {
            let message = pushed.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            self.record_history(SyncAction::Push, SyncState::Success, Some(&message), version)
                .await;
        }

        Ok(SendReport {
            bucket_id,
            since,
            records,
            packed: packed_status,
            pushed,
        })
    }

    /// Push every `RDY`/`ERR` bucket under the sender root, oldest first.
    async fn push_pending(&self) -> Result<Vec<BucketId>> {
        let base_dir = self.config.master.base_dir.clone();
        let pending = run_blocking(move || {
            bucket::control::scan(&base_dir, &[ControlStatus::Ready, ControlStatus::Error])
        })
        .await?;

        if pending.is_empty() {
            info!("No buckets to send");
            return Ok(Vec::new());
        }

        let mut pushed = Vec::with_capacity(pending.len());
        for control in pending {
            let bucket_id = control.bucket_id();
            debug!(
                bucket_id = %bucket_id,
                status = %control.status(),
                retry_count = control.retry_count(),
                "Sending bucket"
            );
            let transport = Arc::clone(&self.transport);
            run_blocking(move || push_one(transport.as_ref(), control)).await?;
            pushed.push(bucket_id);
        }
        Ok(pushed)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Receiver
    // ═══════════════════════════════════════════════════════════════════════════

    /// Import every `RDY` bucket under the receiver root, oldest first.
    ///
    /// Stops at the first bucket that fails. A replay failure writes the
    /// result file, moves the bucket to `ERR`, and returns
    /// [`SyncError::ReplayFailed`]; an integrity failure leaves the bucket
    /// untouched.
    pub async fn receive<D: ReplayTarget>(&self, importer: &ReplayImporter<D>) -> Result<ReceiveReport> {
        let ctx = RunContext::new("receive");
        let started = Instant::now();
        let result = self.receive_inner(&ctx, importer).await;
        metrics::record_run(ctx.action, result.is_ok(), started.elapsed());
        result
    }

    async fn receive_inner<D: ReplayTarget>(
        &self,
        ctx: &RunContext,
        importer: &ReplayImporter<D>,
    ) -> Result<ReceiveReport> {
        let base_dir = self.config.slave.base_dir.clone();
        let ready = run_blocking(move || bucket::control::scan(&base_dir, &[ControlStatus::Ready]))
            .instrument(ctx.span())
            .await
            .map_err(|e| self.report_failure(ctx, e))?;

        if ready.is_empty() {
            info!(action = ctx.action, "No buckets to receive");
        }

        let mut report = ReceiveReport::default();
        for control in ready {
            // Failures carry the bucket in their context.
            let bucket_ctx = ctx.with_bucket(control.bucket_id());
            let import = self
                .import_bucket(importer, control)
                .instrument(bucket_ctx.span())
                .await
                .map_err(|e| self.report_failure(&bucket_ctx, e))?;
            report.imports.push(import);
        }
        Ok(report)
    }

    async fn import_bucket<D: ReplayTarget>(
        &self,
        importer: &ReplayImporter<D>,
        control: ControlFile,
    ) -> Result<BucketImport> {
        let bucket_id = control.bucket_id();
        info!(control = %control.file_name(), retry_count = control.retry_count(), "Importing bucket");

        let unpack_from = control.clone();
        let changeset = run_blocking(move || packager::unpack(&unpack_from)).await?;

        let outcome = importer.replay(&changeset).await;

        let dir = control.dir().to_path_buf();
        let written = outcome.clone();
        let result_file = run_blocking(move || bucket::write_result_file(&dir, &written)).await?;

        let version = outcome.cursor().unwrap_or(changeset.since);
        if outcome.success {
            let control = run_blocking(move || control.transition(ControlStatus::Imported)).await?;
            self.record_history(SyncAction::Import, SyncState::Success, None, version)
                .await;
            return Ok(BucketImport {
                bucket_id,
                outcome,
                status: control.status(),
                result_file,
            });
        }

        let message = outcome
            .failure_message()
            .unwrap_or_else(|| "import failed".to_string());
        run_blocking(move || control.transition(ControlStatus::Error)).await?;
        self.record_history(SyncAction::Import, SyncState::Failure, Some(&message), version)
            .await;

        Err(SyncError::ReplayFailed {
            message,
            failed_event_id: outcome.failed_event_id.unwrap_or_default(),
            last_event_id: outcome.last_event_id,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Count a finished step; log, count and notify a failed one.
    fn finish<R>(&self, ctx: &RunContext, started: Instant, result: Result<R>) -> Result<R> {
        metrics::record_run(ctx.action, result.is_ok(), started.elapsed());
        result.map_err(|e| self.report_failure(ctx, e))
    }

    fn report_failure(&self, ctx: &RunContext, e: SyncError) -> SyncError {
        error!(
            action = ctx.action,
            bucket_id = %ctx.bucket_label(),
            kind = e.kind(),
            error = %e,
            "Sync step failed"
        );
        metrics::record_error(ctx.action, e.kind());
        self.notifier.notify(ctx, &e);
        e
    }

    /// History is informational: a failed write is logged, never fatal.
    async fn record_history(&self, action: SyncAction, state: SyncState, message: Option<&str>, version: u64) {
        if !self.config.history.enabled {
            return;
        }
        let Some(history) = &self.history else {
            return;
        };
        match history.record(action, state, message, version).await {
            Ok(_) => metrics::record_history_write(true),
            Err(e) => {
                metrics::record_history_write(false);
                warn!(action = action.as_str(), error = %e, "Failed to record sync history");
            }
        }
    }
}

/// Requeue an `ERR` bucket, push it, and close it as `END`.
fn push_one<T: Transport + ?Sized>(transport: &T, control: ControlFile) -> Result<ControlFile> {
    let control = match control.status() {
        ControlStatus::Error => control.requeue()?,
        _ => control,
    };
    transport::push_bucket(transport, &control)?;
    control.transition(ControlStatus::End)
}

async fn run_blocking<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Internal(format!("blocking task failed: {}", e)))?
}
