//! Transfer executor - fetches files and installs them atomically.
//!
//! Every file of a phase runs as its own task, gated by a semaphore so at
//! most `max_parallel` transfers are in flight. A file is written to a
//! temporary sibling, stamped with the remote modification time, and only
//! then renamed over its final name. A failure stops that file alone; the
//! phase returns once every task has finished.

pub mod progress;
pub mod progress_stream;

use futures_util::StreamExt;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::diff::{local_path, PendingTransfer};
use crate::fs::{partial_path, stamp_times};
use crate::index::{RemoteEntry, RemoteIndex};
use crate::source::{ByteStream, RemoteSource, SourceRegistry};
use crate::utils::errors::{TransferError, TransferStep};
use progress::{format_bytes, format_duration, format_speed, PhaseProgress, ProgressTracker};
use progress_stream::ProgressStream;

/// How often a running phase logs its progress
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Which diff set a phase is working through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferMode {
    /// No local file yet; parent directories may need creating
    #[default]
    Missing,
    /// A stale local file is replaced in place
    Expired,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Missing => f.write_str("missing"),
            TransferMode::Expired => f.write_str("expired"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Local mirror root
    pub root: PathBuf,

    /// Maximum concurrent transfers
    pub max_parallel: usize,

    /// Temporary file suffix
    pub partial_suffix: String,

    /// Per-file deadline
    pub file_timeout: Option<Duration>,
}

impl From<&SyncConfig> for TransferOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            root: config.root.clone(),
            max_parallel: config.max_parallel.max(1),
            partial_suffix: config.partial_suffix.clone(),
            file_timeout: config.file_timeout(),
        }
    }
}

/// Counts for one phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: TransferMode,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Bytes installed by successful transfers
    pub bytes: u64,
}

impl PhaseReport {
    /// A phase with nothing to do
    pub fn empty(phase: TransferMode) -> Self {
        Self {
            phase,
            ..Self::default()
        }
    }
}

/// Runs transfer phases against one remote index.
pub struct TransferExecutor {
    registry: SourceRegistry,
    index: Arc<RemoteIndex>,
    options: TransferOptions,
    cancel_token: CancellationToken,
}

impl TransferExecutor {
    /// Create a new executor (no cancellation support)
    pub fn new(registry: SourceRegistry, index: Arc<RemoteIndex>, options: TransferOptions) -> Self {
        Self::with_cancel(registry, index, options, CancellationToken::new())
    }

    /// Create a new executor with cancellation support
    pub fn with_cancel(
        registry: SourceRegistry,
        index: Arc<RemoteIndex>,
        options: TransferOptions,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            index,
            options,
            cancel_token,
        }
    }

    /// Transfer every entry of one phase and wait for all of them.
    pub async fn execute(&self, entries: Vec<PendingTransfer>, mode: TransferMode) -> PhaseReport {
        let mut report = PhaseReport {
            attempted: entries.len(),
            ..PhaseReport::empty(mode)
        };
        if entries.is_empty() {
            return report;
        }

        let total_bytes: u64 = entries
            .iter()
            .filter_map(|e| self.index.get(&e.path))
            .map(|e| e.size)
            .sum();
        let progress = Arc::new(PhaseProgress::new(total_bytes, entries.len()));
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel));

        // Child token: stops the reporter without cancelling the run
        let phase_done = self.cancel_token.child_token();
        let reporter = tokio::spawn(report_progress(
            mode,
            Arc::clone(&progress),
            phase_done.clone(),
        ));

        info!(
            "Starting {} phase: {} files, {}, up to {} in parallel",
            mode,
            entries.len(),
            format_bytes(total_bytes),
            self.options.max_parallel
        );

        let mut handles = Vec::with_capacity(entries.len());
        for pending in entries {
            let job = self.prepare(pending, mode);
            let sem = Arc::clone(&semaphore);
            let cancel = self.cancel_token.clone();
            let progress = Arc::clone(&progress);
            let timeout = self.options.file_timeout;

            let handle = tokio::spawn(async move {
                let (path, result) = match job {
                    Ok(job) => {
                        let path = job.entry.path.clone();
                        let result = run_job(job, sem, cancel, Arc::clone(&progress), timeout).await;
                        (path, result)
                    }
                    Err((path, e)) => (path, Err(e)),
                };

                match &result {
                    Ok(bytes) => {
                        debug!("Installed {} ({} bytes)", path, bytes);
                        progress.file_done();
                    }
                    Err(TransferError::Cancelled) => {
                        info!("Transfer of {} cancelled", path);
                        progress.file_failed();
                    }
                    Err(e) => {
                        error!(path = %path, phase = %mode, "Transfer failed: {}", e);
                        progress.file_failed();
                    }
                }
                result
            });

            handles.push(handle);
        }

        // Barrier: the phase ends once every spawned task has finished
        for handle in handles {
            match handle.await {
                Ok(Ok(bytes)) => {
                    report.succeeded += 1;
                    report.bytes += bytes;
                }
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    warn!("Transfer task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        phase_done.cancel();
        let _ = reporter.await;

        info!(
            "Finished {} phase: {} of {} files installed, {} failed, {}",
            mode,
            report.succeeded,
            report.attempted,
            report.failed,
            format_bytes(report.bytes)
        );

        report
    }

    /// Resolve everything a task needs before it is spawned.
    fn prepare(
        &self,
        pending: PendingTransfer,
        mode: TransferMode,
    ) -> Result<TransferJob, (String, TransferError)> {
        let Some(entry) = self.index.get(&pending.path) else {
            return Err((pending.path.clone(), TransferError::NotIndexed(pending.path)));
        };
        let Some(source) = self.registry.get(pending.source) else {
            return Err((pending.path, TransferError::UnknownSource(pending.source)));
        };
        let Some(target) = local_path(&self.options.root, &entry.path) else {
            return Err((pending.path.clone(), TransferError::InvalidPath(pending.path)));
        };

        Ok(TransferJob {
            entry: entry.clone(),
            source,
            partial: partial_path(&target, &self.options.partial_suffix),
            target,
            mode,
        })
    }
}

/// Everything one transfer task owns.
struct TransferJob {
    entry: RemoteEntry,
    source: Arc<dyn RemoteSource>,
    target: PathBuf,
    partial: PathBuf,
    mode: TransferMode,
}

async fn run_job(
    job: TransferJob,
    sem: Arc<Semaphore>,
    cancel: CancellationToken,
    progress: Arc<PhaseProgress>,
    timeout: Option<Duration>,
) -> Result<u64, TransferError> {
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let _permit = tokio::select! {
        permit = sem.acquire_owned() => permit.map_err(|_| TransferError::Cancelled)?,
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
    };

    let install = install_file(&job, progress);
    let bounded = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, install)
                .await
                .unwrap_or(Err(TransferError::Timeout(limit))),
            None => install.await,
        }
    };

    let result = tokio::select! {
        result = bounded => result,
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
    };

    // A timed out or cancelled install is dropped mid-write; its temporary
    // file is removed here along with those of ordinary failures.
    if result.is_err() {
        match tokio::fs::remove_file(&job.partial).await {
            Ok(()) => debug!("Removed {}", job.partial.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", job.partial.display(), e),
        }
    }
    result
}

/// Fetch one file and install it at its final path.
///
/// The final path is only ever touched by the closing rename, so on failure
/// it is left exactly as it was.
async fn install_file(job: &TransferJob, progress: Arc<PhaseProgress>) -> Result<u64, TransferError> {
    let stream = job.source.download(&job.entry.path).await?;

    if job.mode == TransferMode::Missing {
        if let Some(parent) = job.target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(TransferError::at(TransferStep::CreateDir))?;
        }
    }

    write_and_rename(job, stream, progress).await
}

async fn write_and_rename(
    job: &TransferJob,
    stream: ByteStream,
    progress: Arc<PhaseProgress>,
) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(&job.partial)
        .await
        .map_err(TransferError::at(TransferStep::Write))?;

    let mut stream = ProgressStream::new(stream, progress);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(TransferError::at(TransferStep::Download))?;
        file.write_all(&chunk)
            .await
            .map_err(TransferError::at(TransferStep::Write))?;
    }
    let written = stream.bytes_transferred();

    file.flush().await.map_err(TransferError::at(TransferStep::Write))?;
    file.sync_all().await.map_err(TransferError::at(TransferStep::Write))?;
    drop(file);

    if written != job.entry.size {
        return Err(TransferError::SizeMismatch {
            expected: job.entry.size,
            actual: written,
        });
    }

    // Stamped before the rename so the final name never carries a stale mtime
    stamp_times(&job.partial, job.entry.modified).map_err(TransferError::at(TransferStep::Stamp))?;

    tokio::fs::rename(&job.partial, &job.target)
        .await
        .map_err(TransferError::at(TransferStep::Rename))?;

    Ok(written)
}

/// Log phase progress until `done` fires.
async fn report_progress(mode: TransferMode, progress: Arc<PhaseProgress>, done: CancellationToken) {
    let mut tracker = ProgressTracker::new();
    let mut interval = tokio::time::interval(REPORT_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = done.cancelled() => break,
        }

        let snap = tracker.sample(&progress);
        info!(
            "[{}] {:.1}% {}/{} files, {} of {} at {}, ETA {}",
            mode,
            snap.percent_complete,
            snap.files_processed,
            snap.total_files,
            format_bytes(snap.transferred_bytes),
            format_bytes(snap.total_bytes),
            format_speed(snap.bytes_per_second),
            format_duration(snap.eta_seconds)
        );
    }

    debug!(
        "[{}] average speed {} over {}",
        mode,
        format_speed(tracker.average_speed(&progress)),
        format_duration(tracker.elapsed().as_secs())
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::MemorySource;
    use crate::source::SourceId;
    use crate::fs::is_partial_name;
    use chrono::{DateTime, TimeZone, Utc};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn options(root: &Path) -> TransferOptions {
        TransferOptions {
            root: root.to_path_buf(),
            max_parallel: 4,
            partial_suffix: ".partial".to_string(),
            file_timeout: Some(Duration::from_secs(30)),
        }
    }

    struct Fixture {
        registry: SourceRegistry,
        index: Arc<RemoteIndex>,
        id: SourceId,
    }

    async fn fixture(source: MemorySource) -> (Fixture, Arc<MemorySource>) {
        let source = Arc::new(source);
        let mut registry = SourceRegistry::new();
        let id = registry
            .register("mem", Arc::clone(&source) as Arc<dyn RemoteSource>)
            .unwrap();
        let index = crate::index::build_index(&registry, &CancellationToken::new())
            .await
            .unwrap();
        (
            Fixture {
                registry,
                index: Arc::new(index),
                id,
            },
            source,
        )
    }

    fn pending(path: &str, source: SourceId) -> PendingTransfer {
        PendingTransfer {
            path: path.to_string(),
            source,
        }
    }

    fn mtime_secs(path: &Path) -> i64 {
        let modified = fs::metadata(path).unwrap().modified().unwrap();
        DateTime::<Utc>::from(modified).timestamp()
    }

    /// Temporary files left in `dir`
    fn leftover_partials(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.unwrap().file_name().into_string().ok())
            .filter(|name| is_partial_name(name, ".partial"))
            .count()
    }

    #[tokio::test]
    async fn test_missing_file_installed_with_mtime() {
        let body = vec![7u8; 100];
        let (fx, _) = fixture(MemorySource::new().with_file("/a/b.txt", &body, ts(1_600_000_000))).await;
        let temp_dir = TempDir::new().unwrap();

        let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));
        let report = executor
            .execute(vec![pending("/a/b.txt", fx.id)], TransferMode::Missing)
            .await;

        assert_eq!(
            report,
            PhaseReport {
                phase: TransferMode::Missing,
                attempted: 1,
                succeeded: 1,
                failed: 0,
                bytes: 100,
            }
        );
        let target = temp_dir.path().join("a/b.txt");
        assert_eq!(fs::read(&target).unwrap(), body);
        assert_eq!(mtime_secs(&target), 1_600_000_000);
        assert_eq!(leftover_partials(&temp_dir.path().join("a")), 0);
    }

    #[tokio::test]
    async fn test_expired_file_replaced() {
        let (fx, _) = fixture(MemorySource::new().with_file("/c.txt", b"new contents", ts(2_000_000))).await;
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("c.txt");
        fs::write(&target, b"old").unwrap();
        stamp_times(&target, ts(1_000_000)).unwrap();

        let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));
        let report = executor
            .execute(vec![pending("/c.txt", fx.id)], TransferMode::Expired)
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(fs::read(&target).unwrap(), b"new contents");
        assert_eq!(mtime_secs(&target), 2_000_000);
    }

    #[tokio::test]
    async fn test_one_failure_among_ten() {
        let mut source = MemorySource::new();
        for i in 0..10 {
            let body = format!("payload number {i}");
            source = source.with_file(&format!("/batch/f{i}.txt"), body.as_bytes(), ts(5_000 + i));
        }
        let source = source.failing_download("/batch/f3.txt", 6);
        let (fx, _) = fixture(source).await;
        let temp_dir = TempDir::new().unwrap();

        let entries: Vec<PendingTransfer> =
            (0..10).map(|i| pending(&format!("/batch/f{i}.txt"), fx.id)).collect();
        let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));
        let report = executor.execute(entries, TransferMode::Missing).await;

        assert_eq!(report.attempted, 10);
        assert_eq!(report.succeeded, 9);
        assert_eq!(report.failed, 1);

        for i in 0..10 {
            let target = temp_dir.path().join(format!("batch/f{i}.txt"));
            if i == 3 {
                assert!(!target.exists());
            } else {
                assert_eq!(fs::read_to_string(&target).unwrap(), format!("payload number {i}"));
                assert_eq!(mtime_secs(&target), 5_000 + i);
            }
        }
        assert_eq!(leftover_partials(&temp_dir.path().join("batch")), 0);
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_old_file() {
        let source = MemorySource::new()
            .with_file("/keep.txt", b"replacement body", ts(9_000))
            .failing_download("/keep.txt", 4);
        let (fx, _) = fixture(source).await;
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("keep.txt");
        fs::write(&target, b"original").unwrap();
        stamp_times(&target, ts(1_000)).unwrap();

        let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));
        let report = executor
            .execute(vec![pending("/keep.txt", fx.id)], TransferMode::Expired)
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(fs::read(&target).unwrap(), b"original");
        assert_eq!(mtime_secs(&target), 1_000);
        assert_eq!(leftover_partials(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_short_stream_is_rejected() {
        let source = MemorySource::new()
            .with_file("/short.bin", b"1234", ts(1))
            .listed_size("/short.bin", 10);
        let (fx, _) = fixture(source).await;
        let temp_dir = TempDir::new().unwrap();

        let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));
        let report = executor
            .execute(vec![pending("/short.bin", fx.id)], TransferMode::Missing)
            .await;

        assert_eq!(report.failed, 1);
        assert!(!temp_dir.path().join("short.bin").exists());
    }

    #[tokio::test]
    async fn test_unknown_source_and_unindexed_path_fail_alone() {
        let (fx, _) = fixture(MemorySource::new().with_file("/ok.txt", b"ok", ts(1))).await;
        let temp_dir = TempDir::new().unwrap();

        let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));
        let report = executor
            .execute(
                vec![
                    pending("/ok.txt", fx.id),
                    pending("/ok.txt", SourceId::new(9)),
                    pending("/ghost.txt", fx.id),
                ],
                TransferMode::Missing,
            )
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_cancelled_phase_downloads_nothing() {
        let (fx, source) = fixture(MemorySource::new().with_file("/x.txt", b"x", ts(1))).await;
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let executor =
            TransferExecutor::with_cancel(fx.registry, fx.index, options(temp_dir.path()), cancel);
        let report = executor
            .execute(vec![pending("/x.txt", fx.id)], TransferMode::Missing)
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(source.download_count(), 0);
        assert!(!temp_dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_empty_phase() {
        let (fx, _) = fixture(MemorySource::new()).await;
        let temp_dir = TempDir::new().unwrap();
        let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));

        let report = executor.execute(Vec::new(), TransferMode::Expired).await;
        assert_eq!(report, PhaseReport::empty(TransferMode::Expired));
    }

    #[tokio::test]
    async fn test_file_named_like_a_temp_suffix_is_not_clobbered() {
        let x_body = vec![b'X'; 4000];
        let p_body = vec![b'P'; 4000];
        for _ in 0..20 {
            let source = MemorySource::new()
                .with_file("/x", &x_body, ts(100))
                .with_file("/x.partial", &p_body, ts(200));
            let (fx, _) = fixture(source).await;
            let temp_dir = TempDir::new().unwrap();

            let executor = TransferExecutor::new(fx.registry, fx.index, options(temp_dir.path()));
            let report = executor
                .execute(
                    vec![pending("/x", fx.id), pending("/x.partial", fx.id)],
                    TransferMode::Missing,
                )
                .await;

            assert_eq!(report.succeeded, 2);
            assert_eq!(fs::read(temp_dir.path().join("x")).unwrap(), x_body);
            assert_eq!(fs::read(temp_dir.path().join("x.partial")).unwrap(), p_body);
            assert_eq!(mtime_secs(&temp_dir.path().join("x")), 100);
            assert_eq!(mtime_secs(&temp_dir.path().join("x.partial")), 200);
        }
    }

    #[tokio::test]
    async fn test_stalled_download_times_out_alone() {
        let source = MemorySource::new()
            .with_file("/slow.txt", b"never completes", ts(9_000))
            .stalling_download("/slow.txt", 4)
            .with_file("/a.txt", b"fresh a", ts(9_000))
            .with_file("/b.txt", b"fresh b", ts(9_000));
        let (fx, _) = fixture(source).await;
        let temp_dir = TempDir::new().unwrap();
        for name in ["slow.txt", "a.txt", "b.txt"] {
            let target = temp_dir.path().join(name);
            fs::write(&target, b"old").unwrap();
            stamp_times(&target, ts(1_000)).unwrap();
        }

        let opts = TransferOptions {
            file_timeout: Some(Duration::from_millis(200)),
            ..options(temp_dir.path())
        };
        let executor = TransferExecutor::new(fx.registry, fx.index, opts);
        let report = executor
            .execute(
                vec![
                    pending("/slow.txt", fx.id),
                    pending("/a.txt", fx.id),
                    pending("/b.txt", fx.id),
                ],
                TransferMode::Expired,
            )
            .await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);

        let slow = temp_dir.path().join("slow.txt");
        assert_eq!(fs::read(&slow).unwrap(), b"old");
        assert_eq!(mtime_secs(&slow), 1_000);
        assert_eq!(fs::read(temp_dir.path().join("a.txt")).unwrap(), b"fresh a");
        assert_eq!(fs::read(temp_dir.path().join("b.txt")).unwrap(), b"fresh b");
        assert_eq!(leftover_partials(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_download() {
        let source = MemorySource::new()
            .with_file("/hang.bin", b"0123456789", ts(1))
            .stalling_download("/hang.bin", 4);
        let (fx, _) = fixture(source).await;
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let opts = TransferOptions {
            file_timeout: None,
            ..options(temp_dir.path())
        };
        let executor =
            TransferExecutor::with_cancel(fx.registry, fx.index, opts, cancel.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let report = executor
            .execute(vec![pending("/hang.bin", fx.id)], TransferMode::Missing)
            .await;
        trigger.await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(!temp_dir.path().join("hang.bin").exists());
        assert_eq!(leftover_partials(temp_dir.path()), 0);
    }
}
