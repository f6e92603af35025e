//! Sweep of abandoned temporary files under the mirror root.
//!
//! A transfer that dies between creating its temporary sibling and renaming
//! it (crash, kill) leaves the temporary file behind. The sweep walks the
//! local tree at the start of a run and removes them.
//!
//! Temporary names look like `.{name}.{uuid}{suffix}`: hidden, unique per
//! transfer, and never equal to another file's final name. Only files that
//! match this shape are candidates; local files the mirror did not create
//! are never touched.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

/// Outcome of a sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Temporary files removed
    pub removed: usize,

    /// Temporary files that could not be removed
    pub failed: usize,
}

/// Fresh temporary sibling for `target`, e.g. `a/.b.txt.<uuid>.partial`.
pub fn partial_path(target: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(".");
    if let Some(file_name) = target.file_name() {
        name.push(file_name);
    }
    name.push(format!(".{}{}", Uuid::new_v4().simple(), suffix));
    target.with_file_name(name)
}

/// Whether `name` has the shape produced by [`partial_path`].
pub fn is_partial_name(name: &str, suffix: &str) -> bool {
    let Some(stem) = name
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(suffix))
    else {
        return false;
    };
    match stem.rsplit_once('.') {
        Some((original, id)) => {
            !original.is_empty() && id.len() == 32 && Uuid::parse_str(id).is_ok()
        }
        None => false,
    }
}

fn is_partial(entry: &DirEntry, suffix: &str) -> bool {
    entry.file_type().is_file()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| is_partial_name(name, suffix))
}

/// Remove every temporary file under `root` left by an earlier run.
///
/// Files for which `keep` returns true are left alone, so an indexed remote
/// file is never swept. Unreadable directories are skipped with a warning;
/// the sweep never fails the run.
pub fn sweep_partials<F>(root: &Path, suffix: &str, keep: F) -> SweepReport
where
    F: Fn(&Path) -> bool,
{
    let mut report = SweepReport::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable path during sweep: {}", e);
                continue;
            }
        };

        if !is_partial(&entry, suffix) || keep(entry.path()) {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!("Removed orphaned temporary file {}", entry.path().display());
                report.removed += 1;
            }
            Err(e) => {
                warn!("Failed to remove {}: {}", entry.path().display(), e);
                report.failed += 1;
            }
        }
    }

    report
}
