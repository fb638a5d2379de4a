//! tracing subscriber setup: console in developer mode, log file otherwise

use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// `<YYYYMMDDHHMMSS>-<host>-spotter.log`
pub fn log_file_name(now: DateTime<Local>, host: &str) -> String {
    format!("{}-{}-spotter.log", now.format("%Y%m%d%H%M%S"), host)
}

/// `RUST_LOG` wins over the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Returns the log file path when logging
/// to a file.
pub fn init_logging(dev_mode: bool, level: &str, log_dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let filter = env_filter(level);

    if dev_mode {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!("cannot install log subscriber: {}", e))?;
        return Ok(None);
    }

    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(log_file_name(Local::now(), &spotter_core::host_name()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot install log subscriber: {}", e))?;
    Ok(Some(path))
}
