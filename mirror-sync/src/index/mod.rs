//! Remote indexer - builds the authoritative file index for a run.
//!
//! Every source is walked depth-first from `/`. Only files become entries;
//! directories are traversed but never indexed. A listing failure anywhere
//! aborts the whole indexing phase, since an incomplete tree would make the
//! diff report files as up to date when they are not.

use chrono::{DateTime, Utc};
use std::collections::btree_map;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::source::{RemoteSource, SourceId, SourceRegistry};
use crate::utils::errors::{SourceError, SyncError};

/// Metadata of one remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Logical path, e.g. `/docs/guide.md`
    pub path: String,

    /// Size in bytes
    pub size: u64,

    /// Remote modification time
    pub modified: DateTime<Utc>,

    /// Source that listed the file
    pub source: SourceId,
}

/// Logical path -> remote entry, rebuilt from scratch on every run.
#[derive(Debug, Clone, Default)]
pub struct RemoteIndex {
    entries: BTreeMap<String, RemoteEntry>,
}

impl RemoteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the one it replaced.
    pub fn insert(&mut self, entry: RemoteEntry) -> Option<RemoteEntry> {
        self.entries.insert(entry.path.clone(), entry)
    }

    pub fn get(&self, path: &str) -> Option<&RemoteEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries ordered by logical path.
    pub fn iter(&self) -> btree_map::Values<'_, String, RemoteEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

fn check_child_name(dir: &str, name: &str) -> Result<(), SourceError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SourceError::InvalidListing {
            path: dir.to_string(),
            reason: format!("unusable child name {:?}", name),
        });
    }
    Ok(())
}

/// Walk one source into `index`.
///
/// Returns the number of files listed by this source. Entries already in
/// the index under the same logical path are replaced.
pub async fn index_source(
    index: &mut RemoteIndex,
    id: SourceId,
    name: &str,
    source: &dyn RemoteSource,
    cancel: &CancellationToken,
) -> Result<usize, SyncError> {
    let fail = |path: &str, error: SourceError| SyncError::Index {
        source_name: name.to_string(),
        path: path.to_string(),
        error,
    };

    let mut pending = vec!["/".to_string()];
    let mut files = 0usize;

    while let Some(dir) = pending.pop() {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let children = source.list(&dir).await.map_err(|e| fail(&dir, e))?;
        debug!("Listed {} ({} children)", dir, children.len());

        let mut subdirs = Vec::new();
        for child in children {
            check_child_name(&dir, &child.name).map_err(|e| fail(&dir, e))?;

            if child.is_dir {
                subdirs.push(format!("{}{}/", dir, child.name));
                continue;
            }

            let entry = RemoteEntry {
                path: format!("{}{}", dir, child.name),
                size: child.size,
                modified: child.modified,
                source: id,
            };
            if let Some(previous) = index.insert(entry) {
                if previous.source != id {
                    debug!(
                        "{} from {} overrides {}",
                        previous.path, id, previous.source
                    );
                }
            }
            files += 1;
        }

        // Reversed so subdirectories are visited in listing order
        pending.extend(subdirs.into_iter().rev());
    }

    Ok(files)
}

/// Index every registered source, sequentially and in registration order.
pub async fn build_index(
    registry: &SourceRegistry,
    cancel: &CancellationToken,
) -> Result<RemoteIndex, SyncError> {
    let mut index = RemoteIndex::new();

    for (id, name, source) in registry.iter() {
        info!("Indexing source '{}' ({})", name, id);
        let files = index_source(&mut index, id, name, source.as_ref(), cancel).await?;
        info!("Source '{}' lists {} files", name, files);
    }

    Ok(index)
}
