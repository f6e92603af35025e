//! Remote sources and the registry that routes transfers to them.
//!
//! A source only has to answer two questions: what are the children of a
//! directory, and what are the bytes of a file. Every indexed entry carries
//! the [`SourceId`] of the source that listed it, so downloads are always
//! dispatched back to the same backend.

pub mod http;
pub mod local;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{SourceConfig, SourceKind};
use crate::utils::errors::{SourceError, SyncError};

/// Body of a remote file.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Identifier of a configured source, assigned in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(u16);

impl SourceId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source #{}", self.0)
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChild {
    pub name: String,

    #[serde(default)]
    pub is_dir: bool,

    /// Size in bytes (ignored for directories)
    #[serde(default)]
    pub size: u64,

    /// Last modification time
    #[serde(default)]
    pub modified: DateTime<Utc>,
}

impl RemoteChild {
    pub fn file(name: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            size,
            modified,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            size: 0,
            modified: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Capability a remote backend provides to the indexer and the executor.
///
/// Paths are logical: rooted at `/`, forward-slash separated. Directory
/// paths passed to [`RemoteSource::list`] always end with `/`.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// List the immediate children of a directory.
    async fn list(&self, path: &str) -> Result<Vec<RemoteChild>, SourceError>;

    /// Open a byte stream for a file.
    async fn download(&self, path: &str) -> Result<ByteStream, SourceError>;
}

#[derive(Clone)]
struct RegisteredSource {
    name: String,
    source: Arc<dyn RemoteSource>,
}

/// Ordered set of configured sources, keyed by [`SourceId`].
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<SourceId, RegisteredSource>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry for the configured sources, in order.
    pub fn from_config(configs: &[SourceConfig]) -> Result<Self, SyncError> {
        let mut registry = Self::new();
        for config in configs {
            let source: Arc<dyn RemoteSource> = match config.kind {
                SourceKind::Local => {
                    let root = config.path.clone().ok_or_else(|| {
                        SyncError::Config(format!("source '{}' has no path", config.name))
                    })?;
                    Arc::new(local::LocalDirSource::new(root))
                }
                SourceKind::Http => {
                    let url = config.url.clone().ok_or_else(|| {
                        SyncError::Config(format!("source '{}' has no url", config.name))
                    })?;
                    Arc::new(http::HttpSource::new(url, config.token.clone()))
                }
            };
            registry.register(config.name.clone(), source)?;
        }
        Ok(registry)
    }

    /// Add a source; it receives the next identifier.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        source: Arc<dyn RemoteSource>,
    ) -> Result<SourceId, SyncError> {
        let next = u16::try_from(self.sources.len())
            .map_err(|_| SyncError::Config("too many sources".to_string()))?;
        let id = SourceId::new(next);
        self.sources.insert(
            id,
            RegisteredSource {
                name: name.into(),
                source,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<dyn RemoteSource>> {
        self.sources.get(&id).map(|s| Arc::clone(&s.source))
    }

    pub fn name(&self, id: SourceId) -> Option<&str> {
        self.sources.get(&id).map(|s| s.name.as_str())
    }

    /// Sources in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &str, &Arc<dyn RemoteSource>)> {
        self.sources
            .iter()
            .map(|(id, s)| (*id, s.name.as_str(), &s.source))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.sources.iter().map(|(id, s)| (id, &s.name)))
            .finish()
    }
}
