//! A directory on a mounted volume exposed as a remote source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::{ByteStream, RemoteChild, RemoteSource};
use crate::utils::errors::SourceError;

pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn not_found_or(path: &str, err: std::io::Error) -> SourceError {
    if err.kind() == ErrorKind::NotFound {
        SourceError::NotFound(path.to_string())
    } else {
        SourceError::Io(err)
    }
}

#[async_trait]
impl RemoteSource for LocalDirSource {
    async fn list(&self, path: &str) -> Result<Vec<RemoteChild>, SourceError> {
        let dir = self.resolve(path);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| not_found_or(path, e))?;

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!("Skipping non UTF-8 name in {}", dir.display());
                continue;
            };

            // Follow symlinks; broken ones are skipped
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Skipping dangling link {}", entry.path().display());
                    continue;
                }
                Err(e) => return Err(SourceError::Io(e)),
            };

            if metadata.is_dir() {
                children.push(RemoteChild::dir(name));
            } else {
                let modified = DateTime::<Utc>::from(metadata.modified()?);
                children.push(RemoteChild::file(name, metadata.len(), modified));
            }
        }

        Ok(children)
    }

    async fn download(&self, path: &str) -> Result<ByteStream, SourceError> {
        let file = tokio::fs::File::open(self.resolve(path))
            .await
            .map_err(|e| not_found_or(path, e))?;
        Ok(ReaderStream::new(file).boxed())
    }
}
