//! Local filesystem helpers: per-file state probing, time stamping and
//! cleanup of abandoned temporary files.

pub mod metadata;
pub mod walker;

pub use metadata::{stamp_times, LocalFileState};
pub use walker::{is_partial_name, partial_path, sweep_partials, SweepReport};
