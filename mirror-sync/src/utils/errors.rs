//! Error types for the mirror agent.
//!
//! Three layers, matching how failures propagate through a run:
//! - [`SourceError`]: a remote listing or download went wrong.
//! - [`TransferError`]: one file could not be installed; the run continues.
//! - [`SyncError`]: the run itself cannot continue.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::source::SourceId;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote returned status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("Remote path not found: {0}")]
    NotFound(String),

    #[error("Invalid listing for {path}: {reason}")]
    InvalidListing { path: String, reason: String },

    #[error("Invalid source URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// The step of the install protocol a per-file failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    Download,
    CreateDir,
    Write,
    Stamp,
    Rename,
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStep::Download => "download",
            TransferStep::CreateDir => "create directory",
            TransferStep::Write => "write",
            TransferStep::Stamp => "set modification time",
            TransferStep::Rename => "rename",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No source registered for {0}")]
    UnknownSource(SourceId),

    #[error("Path is not in the remote index: {0}")]
    NotIndexed(String),

    #[error("Path cannot be mapped under the local root: {0}")]
    InvalidPath(String),

    #[error("Download failed: {0}")]
    Download(#[from] SourceError),

    #[error("{step} failed: {error}")]
    Step {
        step: TransferStep,
        #[source]
        error: std::io::Error,
    },

    #[error("Expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

impl TransferError {
    /// Adapter for `map_err` on a failed I/O step.
    pub fn at(step: TransferStep) -> impl FnOnce(std::io::Error) -> Self {
        move |error| TransferError::Step { step, error }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Indexing source '{source_name}' failed at {path}: {error}")]
    Index {
        source_name: String,
        path: String,
        #[source]
        error: SourceError,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
