//! Configuration management for the mirror agent.
//!
//! Loads configuration from a TOML file; command-line flags are applied on
//! top of it by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::diff::StalenessPolicy;
use crate::utils::errors::SyncError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Remote sources, indexed in this order (later sources win on collisions)
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local directory that mirrors the remote logical root
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Compute the diff and report it without writing anything
    #[serde(default)]
    pub dry_run: bool,

    /// Maximum number of concurrent file transfers
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Also treat a local file smaller than the remote one as expired
    #[serde(default)]
    pub strict_size_check: bool,

    /// Suffix of the temporary sibling a download is written to
    #[serde(default = "default_partial_suffix")]
    pub partial_suffix: String,

    /// Per-file transfer timeout in seconds (0 disables the timeout)
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,

    /// Remove orphaned temporary files left by earlier runs
    #[serde(default = "default_clean_partials")]
    pub clean_partials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A directory on a mounted volume
    Local,
    /// An HTTP endpoint exposing `/list` and `/files`
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Display name used in logs
    pub name: String,

    pub kind: SourceKind,

    /// Root directory (local sources)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Base URL (http sources)
    #[serde(default)]
    pub url: Option<String>,

    /// Static bearer token sent with every request (http sources)
    #[serde(default)]
    pub token: Option<String>,
}

// Default values
fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_parallel() -> usize {
    16
}

fn default_partial_suffix() -> String {
    ".partial".to_string()
}

fn default_file_timeout_secs() -> u64 {
    600
}

fn default_clean_partials() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            dry_run: false,
            max_parallel: default_max_parallel(),
            strict_size_check: false,
            partial_suffix: default_partial_suffix(),
            file_timeout_secs: default_file_timeout_secs(),
            clean_partials: default_clean_partials(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SyncConfig {
    pub fn staleness_policy(&self) -> StalenessPolicy {
        StalenessPolicy::from_strict(self.strict_size_check)
    }

    pub fn file_timeout(&self) -> Option<Duration> {
        (self.file_timeout_secs > 0).then(|| Duration::from_secs(self.file_timeout_secs))
    }
}

impl SourceConfig {
    /// Guess the source kind from a bare command-line location.
    pub fn from_location(name: String, location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self {
                name,
                kind: SourceKind::Http,
                path: None,
                url: Some(location.to_string()),
                token: None,
            }
        } else {
            Self {
                name,
                kind: SourceKind::Local,
                path: Some(PathBuf::from(location)),
                url: None,
                token: None,
            }
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject settings a run cannot work with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sources.is_empty() {
            return Err(SyncError::Config("no sources configured".to_string()));
        }
        if self.sync.max_parallel == 0 {
            return Err(SyncError::Config("max_parallel must be at least 1".to_string()));
        }
        let suffix = &self.sync.partial_suffix;
        if suffix.is_empty() || suffix.contains('/') || suffix.contains('\\') {
            return Err(SyncError::Config(format!(
                "partial_suffix must be a non-empty file name suffix, got {:?}",
                suffix
            )));
        }
        for source in &self.sources {
            let location_set = match source.kind {
                SourceKind::Local => source.path.is_some(),
                SourceKind::Http => source.url.as_deref().is_some_and(|u| !u.is_empty()),
            };
            if !location_set {
                return Err(SyncError::Config(format!(
                    "source '{}' has no {}",
                    source.name,
                    match source.kind {
                        SourceKind::Local => "path",
                        SourceKind::Http => "url",
                    }
                )));
            }
        }
        Ok(())
    }
}
