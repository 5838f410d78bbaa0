//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Export volume
//! - Replay results and duration
//! - Bucket packaging and integrity failures
//! - Control-file transitions
//! - Transport pushes
//! - Lock contention and errors
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `catalog_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use catalog_sync::metrics;
//! use std::time::Duration;
//!
//! // After a replay attempt
//! metrics::record_replay(40, 2, 0, Duration::from_millis(350));
//!
//! // After packing a bucket
//! metrics::record_bucket_packed(18_432);
//! ```

use metrics::{counter, histogram};
use std::time::Duration;

/// Record change records exported into a change-set.
pub fn record_records_exported(count: usize) {
    counter!("catalog_sync_records_exported_total").increment(count as u64);
}

/// Record a finished replay attempt.
pub fn record_replay(applied: usize, skipped: usize, failed: usize, duration: Duration) {
    counter!("catalog_sync_records_applied_total").increment(applied as u64);
    if skipped > 0 {
        counter!("catalog_sync_records_skipped_total").increment(skipped as u64);
    }
    if failed > 0 {
        counter!("catalog_sync_records_failed_total").increment(failed as u64);
    }
    histogram!("catalog_sync_replay_duration_seconds").record(duration.as_secs_f64());
}

/// Record a packed bucket and its compressed size.
pub fn record_bucket_packed(compressed_bytes: u64) {
    counter!("catalog_sync_buckets_packed_total").increment(1);
    histogram!("catalog_sync_bucket_compressed_bytes").record(compressed_bytes as f64);
}

/// Record an integrity check failure (`size` or `checksum`).
pub fn record_integrity_failure(kind: &str) {
    counter!("catalog_sync_integrity_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Record a control file reaching a status (creation or rename).
pub fn record_transition(status: &str) {
    counter!("catalog_sync_control_transitions_total", "status" => status.to_string()).increment(1);
}

/// Record a bucket push.
pub fn record_push(success: bool, files: usize) {
    let status = if success { "success" } else { "failure" };
    counter!("catalog_sync_pushes_total", "status" => status).increment(1);
    if success {
        counter!("catalog_sync_files_pushed_total").increment(files as u64);
    }
}

/// Record a failed attempt to take an exclusive file lock.
pub fn record_lock_contention() {
    counter!("catalog_sync_lock_contentions_total").increment(1);
}

/// Record a fatal error by action and error kind.
pub fn record_error(action: &str, kind: &str) {
    counter!("catalog_sync_errors_total", "action" => action.to_string(), "kind" => kind.to_string()).increment(1);
}

/// Record a completed run of an action.
pub fn record_run(action: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("catalog_sync_runs_total", "action" => action.to_string(), "status" => status).increment(1);
    histogram!("catalog_sync_run_duration_seconds", "action" => action.to_string())
        .record(duration.as_secs_f64());
}

/// Record a sync history write.
pub fn record_history_write(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("catalog_sync_history_writes_total", "status" => status).increment(1);
}

/// Record history SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn history_retries_total(operation: &str) {
    counter!("catalog_sync_history_retries_total", "operation" => operation.to_string()).increment(1);
}
