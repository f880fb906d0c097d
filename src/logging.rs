//! Structured job logging.
//!
//! Job and item outcomes are `tracing` events with fields (`job_id`, `item`,
//! `outcome`, `attempt`). They go to the systemd journal on Linux when it is
//! reachable, to a daily-rolling file otherwise, and to stderr if the log
//! directory cannot be created.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "FACEMATCH_LOG";

const DEFAULT_DIRECTIVES: &str = "info,ureq=warn,rustls=warn";
const LOG_FILE_PREFIX: &str = "facematch.log";

// Flushes the file writer until process exit.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backend {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    Journald,
    File(PathBuf),
    Stderr,
}

impl Backend {
    fn describe(&self) -> String {
        match self {
            Backend::Journald => "journald".to_string(),
            Backend::File(dir) => format!("file in {}", dir.display()),
            Backend::Stderr => "stderr".to_string(),
        }
    }
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Where logs go when no directory is given.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facematch")
        .join("logs")
}

fn file_or_stderr(dir: &Path) -> Backend {
    match std::fs::create_dir_all(dir) {
        Ok(()) => Backend::File(dir.to_path_buf()),
        Err(_) => Backend::Stderr,
    }
}

/// Install the global subscriber. Filter directives come from
/// `FACEMATCH_LOG` (e.g. `FACEMATCH_LOG=facematch=debug`).
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let filter = filter_from(std::env::var(LOG_ENV).ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter);

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            registry.with(journald).try_init()?;
            tracing::info!(backend = %Backend::Journald.describe(), "Logging initialized");
            return Ok(());
        }
    }

    let backend = file_or_stderr(&log_dir.unwrap_or_else(default_log_dir));
    match &backend {
        Backend::File(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()?;
        }
        _ => {
            registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }

    tracing::info!(backend = %backend.describe(), "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_log_dir() {
        assert!(default_log_dir().ends_with("facematch/logs"));
    }

    #[test]
    fn test_missing_directives_use_default() {
        assert_eq!(filter_from(None).to_string(), EnvFilter::new(DEFAULT_DIRECTIVES).to_string());
        assert_eq!(filter_from(Some("debug")).to_string(), "debug");
    }

    #[test]
    fn test_unwritable_log_dir_uses_stderr() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        assert_eq!(file_or_stderr(&blocker.join("logs")), Backend::Stderr);
        assert_eq!(
            file_or_stderr(&dir.path().join("logs")),
            Backend::File(dir.path().join("logs"))
        );
    }
}
