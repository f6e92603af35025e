//! Utility modules for the mirror agent.

pub mod errors;
pub mod logger;

pub use crate::Result;
pub use errors::{SourceError, SyncError, TransferError, TransferStep};
