//! In-memory remote source for tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ByteStream, RemoteChild, RemoteSource};
use crate::utils::errors::SourceError;

const CHUNK_SIZE: usize = 4;

/// How a download stops short of the full body.
#[derive(Debug, Clone, Copy)]
enum Interruption {
    /// Yield this many bytes, then an I/O error
    Fail(usize),
    /// Yield this many bytes, then never produce another item
    Stall(usize),
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
    listed_size: Option<u64>,
    interruption: Option<Interruption>,
}

/// A remote tree held in memory, with hooks to make listings or downloads fail.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: BTreeMap<String, MemoryFile>,
    failing_dirs: HashSet<String>,
    downloads: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: &[u8], modified: DateTime<Utc>) -> Self {
        self.files.insert(
            path.to_string(),
            MemoryFile {
                data: data.to_vec(),
                modified,
                listed_size: None,
                interruption: None,
            },
        );
        self
    }

    /// Listing `dir` fails with an I/O error.
    pub fn failing_listing(mut self, dir: &str) -> Self {
        self.failing_dirs.insert(dir.to_string());
        self
    }

    /// Downloading `path` yields `after` bytes, then an error.
    pub fn failing_download(mut self, path: &str, after: usize) -> Self {
        if let Some(file) = self.files.get_mut(path) {
            file.interruption = Some(Interruption::Fail(after));
        }
        self
    }

    /// Downloading `path` yields `after` bytes, then hangs.
    pub fn stalling_download(mut self, path: &str, after: usize) -> Self {
        if let Some(file) = self.files.get_mut(path) {
            file.interruption = Some(Interruption::Stall(after));
        }
        self
    }

    /// Report a size in listings that differs from the actual body.
    pub fn listed_size(mut self, path: &str, size: u64) -> Self {
        if let Some(file) = self.files.get_mut(path) {
            file.listed_size = Some(size);
        }
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    async fn list(&self, path: &str) -> Result<Vec<RemoteChild>, SourceError> {
        if self.failing_dirs.contains(path) {
            return Err(SourceError::Io(std::io::Error::other(format!(
                "listing {} refused",
                path
            ))));
        }

        let mut dirs = BTreeSet::new();
        let mut children = Vec::new();
        for (key, file) in self.files.range(path.to_string()..) {
            let Some(rest) = key.strip_prefix(path) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    dirs.insert(dir.to_string());
                }
                None => children.push(RemoteChild::file(
                    rest,
                    file.listed_size.unwrap_or(file.data.len() as u64),
                    file.modified,
                )),
            }
        }

        if children.is_empty() && dirs.is_empty() && path != "/" {
            return Err(SourceError::NotFound(path.to_string()));
        }

        children.extend(dirs.into_iter().map(RemoteChild::dir));
        Ok(children)
    }

    async fn download(&self, path: &str) -> Result<ByteStream, SourceError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let file = self
            .files
            .get(path)
            .ok_or_else(|| SourceError::NotFound(path.to_string()))?;

        let data = match file.interruption {
            Some(Interruption::Fail(after) | Interruption::Stall(after)) => {
                &file.data[..after.min(file.data.len())]
            }
            None => &file.data[..],
        };

        let mut chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        match file.interruption {
            Some(Interruption::Fail(_)) => {
                chunks.push(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset mid-transfer",
                )));
                Ok(stream::iter(chunks).boxed())
            }
            Some(Interruption::Stall(_)) => Ok(stream::iter(chunks)
                .chain(stream::pending())
                .boxed()),
            None => Ok(stream::iter(chunks).boxed()),
        }
    }
}
