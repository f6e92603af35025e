//! Mirror Sync - Main entry point
//!
//! Brings the local mirror root up to date with the configured sources.

use anyhow::{bail, Result};
use clap::Parser;
use mirror_sync::config::{Config, SourceConfig};
use mirror_sync::shutdown::ShutdownCoordinator;
use mirror_sync::source::SourceRegistry;
use mirror_sync::{utils, Reconciler};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Local mirror root (overrides config)
    #[arg(short, long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Extra source: a directory or an http(s) URL, may be repeated
    #[arg(short, long = "source", value_name = "DIR|URL")]
    sources: Vec<String>,

    /// Compute the diff only, write nothing
    #[arg(long)]
    dry_run: bool,

    /// Maximum concurrent transfers (overrides config)
    #[arg(short = 'j', long)]
    max_parallel: Option<usize>,

    /// Also treat smaller local files as expired
    #[arg(long)]
    strict_size_check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(root) = args.root {
        config.sync.root = root;
    }
    if let Some(max_parallel) = args.max_parallel {
        config.sync.max_parallel = max_parallel;
    }
    config.sync.dry_run |= args.dry_run;
    config.sync.strict_size_check |= args.strict_size_check;
    for location in &args.sources {
        let name = format!("source-{}", config.sources.len());
        config.sources.push(SourceConfig::from_location(name, location));
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    config.validate()?;

    tracing::info!(
        "Starting mirror-sync v{} into {}",
        env!("CARGO_PKG_VERSION"),
        config.sync.root.display()
    );

    let registry = SourceRegistry::from_config(&config.sources)?;

    // The run observes the token and winds down on its own
    let shutdown = ShutdownCoordinator::new();
    let reconciler = Reconciler::with_cancel(registry, config.sync.clone(), shutdown.token());
    let signal_task = tokio::spawn(async move { shutdown.wait_for_signal().await });

    let result = reconciler.run().await;
    signal_task.abort();

    let report = result?;
    report.log_summary();

    if report.cancelled {
        bail!("Run cancelled before completion");
    }

    Ok(())
}
