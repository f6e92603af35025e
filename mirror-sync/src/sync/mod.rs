//! Run orchestration - index, diff, then the two transfer phases.
//!
//! Phase order is fixed: every missing file is attempted and joined before
//! the first expired file is touched. Indexing failures end the run; file
//! failures are counted and the run carries on.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::diff::{diff_index_blocking, local_path, DiffResult};
use crate::fs::{sweep_partials, SweepReport};
use crate::index::{build_index, RemoteIndex};
use crate::source::SourceRegistry;
use crate::transfer::progress::{format_bytes, format_duration};
use crate::transfer::{PhaseReport, TransferExecutor, TransferMode, TransferOptions};
use crate::Result;

/// Summary of one run
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub dry_run: bool,

    /// Files and bytes in the remote index
    pub remote_files: usize,
    pub remote_bytes: u64,

    /// Planned work as found by the diff
    pub missing_files: usize,
    pub missing_bytes: u64,
    pub expired_files: usize,
    pub expired_bytes: u64,

    /// Entries skipped by the diff
    pub anomalies: usize,

    pub sweep: SweepReport,
    pub missing: PhaseReport,
    pub expired: PhaseReport,

    /// Cancellation stopped the run before both phases completed
    pub cancelled: bool,

    pub duration: Duration,
}

impl SyncReport {
    /// Files that were attempted or skipped without ending up current.
    pub fn failed_files(&self) -> usize {
        self.missing.failed + self.expired.failed + self.anomalies
    }

    pub fn is_up_to_date(&self) -> bool {
        !self.dry_run && !self.cancelled && self.failed_files() == 0
    }

    pub fn log_summary(&self) {
        info!(
            "Remote index: {} files, {}",
            self.remote_files,
            format_bytes(self.remote_bytes)
        );
        if self.dry_run {
            info!(
                "Dry run: {} missing ({}), {} expired ({}), {} skipped",
                self.missing_files,
                format_bytes(self.missing_bytes),
                self.expired_files,
                format_bytes(self.expired_bytes),
                self.anomalies
            );
            return;
        }
        info!(
            "Missing: {} attempted, {} downloaded, {} failed ({})",
            self.missing.attempted,
            self.missing.succeeded,
            self.missing.failed,
            format_bytes(self.missing.bytes)
        );
        info!(
            "Expired: {} attempted, {} replaced, {} failed ({})",
            self.expired.attempted,
            self.expired.succeeded,
            self.expired.failed,
            format_bytes(self.expired.bytes)
        );
        if self.anomalies > 0 {
            warn!("{} files skipped, see warnings above", self.anomalies);
        }
        if self.sweep.removed > 0 {
            info!("Removed {} orphaned temporary files", self.sweep.removed);
        }
        if self.sweep.failed > 0 {
            warn!(
                "{} orphaned temporary files could not be removed",
                self.sweep.failed
            );
        }
        info!("Run {} took {}", self.run_id, format_duration(self.duration.as_secs()));
        if self.is_up_to_date() {
            info!("Everything is up to date!");
        }
    }
}

/// Reconciles the local mirror root against the configured sources.
pub struct Reconciler {
    registry: SourceRegistry,
    config: SyncConfig,
    cancel_token: CancellationToken,
}

impl Reconciler {
    pub fn new(registry: SourceRegistry, config: SyncConfig) -> Self {
        Self::with_cancel(registry, config, CancellationToken::new())
    }

    pub fn with_cancel(
        registry: SourceRegistry,
        config: SyncConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            config,
            cancel_token,
        }
    }

    /// Run one full reconciliation.
    pub async fn run(&self) -> Result<SyncReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncReport> {
        let start_time = Instant::now();
        let mut report = SyncReport {
            run_id,
            dry_run: self.config.dry_run,
            missing: PhaseReport::empty(TransferMode::Missing),
            expired: PhaseReport::empty(TransferMode::Expired),
            ..SyncReport::default()
        };

        info!(
            "Building file index from {} source(s), please wait...",
            self.registry.len()
        );
        let index = Arc::new(build_index(&self.registry, &self.cancel_token).await?);
        report.remote_files = index.len();
        report.remote_bytes = index.total_bytes();
        info!(
            "Found {} remote files, checking for need in update...",
            index.len()
        );

        let root = self.config.root.clone();
        let diff = diff_index_blocking(
            Arc::clone(&index),
            root.clone(),
            self.config.staleness_policy(),
        )
        .await?;
        self.record_diff(&diff, &mut report);

        if self.config.dry_run {
            for pending in &diff.missing {
                info!("Would download {}", pending.path);
            }
            for pending in &diff.expired {
                info!("Would replace {}", pending.path);
            }
            report.duration = start_time.elapsed();
            return Ok(report);
        }

        if self.config.clean_partials {
            report.sweep = self.sweep(&index, root).await?;
        }

        let executor = TransferExecutor::with_cancel(
            self.registry.clone(),
            Arc::clone(&index),
            TransferOptions::from(&self.config),
            self.cancel_token.clone(),
        );

        let DiffResult {
            missing, expired, ..
        } = diff;

        if !missing.is_empty() {
            info!(
                "Downloading {} missing files, {} in total...",
                missing.len(),
                format_bytes(report.missing_bytes)
            );
            report.missing = executor.execute(missing, TransferMode::Missing).await;
        }

        if self.cancel_token.is_cancelled() {
            warn!("Run cancelled, skipping remaining transfers");
            report.expired.attempted = expired.len();
            report.expired.failed = expired.len();
            report.cancelled = true;
            report.duration = start_time.elapsed();
            return Ok(report);
        }

        if !expired.is_empty() {
            info!(
                "Overriding {} expired files, {} in total...",
                expired.len(),
                format_bytes(report.expired_bytes)
            );
            report.expired = executor.execute(expired, TransferMode::Expired).await;
        }

        report.cancelled = self.cancel_token.is_cancelled();
        report.duration = start_time.elapsed();
        Ok(report)
    }

    fn record_diff(&self, diff: &DiffResult, report: &mut SyncReport) {
        for anomaly in &diff.anomalies {
            warn!("Skipping {}: {}", anomaly.path, anomaly.reason);
        }
        report.missing_files = diff.missing.len();
        report.missing_bytes = diff.missing_bytes;
        report.expired_files = diff.expired.len();
        report.expired_bytes = diff.expired_bytes;
        report.anomalies = diff.anomalies.len();
        info!(
            "{} missing ({}), {} expired ({}), {} skipped",
            report.missing_files,
            format_bytes(report.missing_bytes),
            report.expired_files,
            format_bytes(report.expired_bytes),
            report.anomalies
        );
    }

    /// Remove leftovers of interrupted transfers, sparing indexed files.
    async fn sweep(&self, index: &RemoteIndex, root: PathBuf) -> Result<SweepReport> {
        let keep: HashSet<PathBuf> = index
            .iter()
            .filter_map(|e| local_path(&root, &e.path))
            .collect();
        let suffix = self.config.partial_suffix.clone();

        let report = tokio::task::spawn_blocking(move || {
            sweep_partials(&root, &suffix, |p| keep.contains(p))
        })
        .await?;
        Ok(report)
    }
}
