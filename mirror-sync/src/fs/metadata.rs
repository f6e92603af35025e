//! Local file state as seen by the diff, and modification time stamping.
//!
//! The local filesystem carries the whole sync state: a file whose mtime
//! matches the remote one is considered current, so stamping the remote
//! mtime onto every installed file is what makes the next run a no-op.

use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// What the diff needs to know about an existing local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileState {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: DateTime<Utc>,

    /// Is this a directory?
    pub is_dir: bool,
}

impl LocalFileState {
    /// Stat `path`, following symlinks.
    ///
    /// Returns `Ok(None)` when nothing exists at `path`; any other stat
    /// failure is returned as is.
    pub fn probe(path: &Path) -> std::io::Result<Option<Self>> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(Self {
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
            is_dir: metadata.is_dir(),
        }))
    }
}

pub fn to_file_time(time: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos())
}

/// Set both access and modification time of `path` to `modified`.
pub fn stamp_times(path: &Path, modified: DateTime<Utc>) -> std::io::Result<()> {
    let time = to_file_time(modified);
    filetime::set_file_times(path, time, time)
}
