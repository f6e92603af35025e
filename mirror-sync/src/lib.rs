//! Mirror Sync Library
//!
//! One-directional mirror of one or more remote file trees into a local
//! directory. A run indexes every configured source, diffs the index against
//! the local filesystem, then downloads missing files and replaces expired
//! ones through a temp-file-then-rename install.

pub mod config;
pub mod diff;
pub mod fs;
pub mod index;
pub mod shutdown;
pub mod source;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use sync::{Reconciler, SyncReport};
pub use utils::errors::SyncError;
pub type Result<T> = std::result::Result<T, SyncError>;
