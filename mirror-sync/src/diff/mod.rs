//! Diff engine - classifies indexed files as missing or expired locally.
//!
//! Local state is sampled lazily, one stat per remote entry, against the
//! mirror root. A file that exists and is not older than its remote
//! counterpart is left alone and costs nothing but the stat.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::fs::LocalFileState;
use crate::index::{RemoteEntry, RemoteIndex};
use crate::source::SourceId;
use crate::utils::errors::SyncError;

/// How an existing local file is judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalenessPolicy {
    /// Local modification time is strictly older than the remote one
    #[default]
    ModifiedTime,
    /// As above, or the local file is smaller than the remote one
    ModifiedTimeOrSmaller,
}

impl StalenessPolicy {
    pub fn from_strict(strict_size_check: bool) -> Self {
        if strict_size_check {
            Self::ModifiedTimeOrSmaller
        } else {
            Self::ModifiedTime
        }
    }

    /// Timestamps are compared at whole-second resolution.
    pub fn is_stale(self, local: &LocalFileState, remote: &RemoteEntry) -> bool {
        let older = local.modified.timestamp() < remote.modified.timestamp();
        match self {
            Self::ModifiedTime => older,
            Self::ModifiedTimeOrSmaller => older || local.size < remote.size,
        }
    }
}

/// A file scheduled for transfer, routed to the source that listed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub path: String,
    pub source: SourceId,
}

impl From<&RemoteEntry> for PendingTransfer {
    fn from(entry: &RemoteEntry) -> Self {
        Self {
            path: entry.path.clone(),
            source: entry.source,
        }
    }
}

/// A remote entry whose local counterpart cannot be probed or written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub path: String,
    pub reason: String,
}

/// Result of diffing a remote index against the local tree
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// No local counterpart
    pub missing: Vec<PendingTransfer>,
    pub missing_bytes: u64,

    /// Local counterpart is stale
    pub expired: Vec<PendingTransfer>,
    pub expired_bytes: u64,

    /// Skipped entries (directory in the way, unmappable path, stat error)
    pub anomalies: Vec<Anomaly>,
}

impl DiffResult {
    /// No file needs a transfer.
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.expired.is_empty()
    }
}

/// Map a logical path (`/a/b.txt`) onto the local mirror root.
///
/// Returns `None` for paths that would escape or alias the root:
/// parent or current directory components, empty segments, or a bare `/`.
pub fn local_path(root: &Path, logical: &str) -> Option<PathBuf> {
    let relative = logical.strip_prefix('/')?;
    if relative.is_empty() {
        return None;
    }

    let mut path = root.to_path_buf();
    for segment in relative.split('/') {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == segment => path.push(part),
            _ => return None,
        }
    }
    Some(path)
}

/// Compare every indexed file with the local tree under `root`.
pub fn diff_index(index: &RemoteIndex, root: &Path, policy: StalenessPolicy) -> DiffResult {
    let mut result = DiffResult::default();

    for entry in index.iter() {
        let Some(target) = local_path(root, &entry.path) else {
            result.anomalies.push(Anomaly {
                path: entry.path.clone(),
                reason: "path cannot be mapped under the local root".to_string(),
            });
            continue;
        };

        match LocalFileState::probe(&target) {
            Ok(None) => {
                result.missing_bytes += entry.size;
                result.missing.push(entry.into());
            }
            Ok(Some(local)) if local.is_dir => {
                result.anomalies.push(Anomaly {
                    path: entry.path.clone(),
                    reason: format!("{} is a directory", target.display()),
                });
            }
            Ok(Some(local)) => {
                if policy.is_stale(&local, entry) {
                    debug!(
                        "{} expired (local {}, remote {})",
                        entry.path, local.modified, entry.modified
                    );
                    result.expired_bytes += entry.size;
                    result.expired.push(entry.into());
                }
            }
            Err(e) => {
                result.anomalies.push(Anomaly {
                    path: entry.path.clone(),
                    reason: format!("cannot stat {}: {}", target.display(), e),
                });
            }
        }
    }

    result
}

/// Run [`diff_index`] on the blocking pool.
pub async fn diff_index_blocking(
    index: Arc<RemoteIndex>,
    root: PathBuf,
    policy: StalenessPolicy,
) -> Result<DiffResult, SyncError> {
    let result = tokio::task::spawn_blocking(move || diff_index(&index, &root, policy)).await?;
    Ok(result)
}
