//! Optional logging bootstrap for processes embedding the cache.
//!
//! The cache itself only emits `tracing` events. Hosts that have no subscriber of their own can
//! call [`init`] once to get an env-filtered stderr sink plus a rolling log file, with `log`
//! records bridged into `tracing`. Repeated calls hand back the handle installed first.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::Rotation;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, util::SubscriberInitExt};

const ENV_FILTER_VARS: [&str; 2] = ["BLOBCACHE_LOG", "RUST_LOG"];
const LOG_DIR: &str = "logs";
const LOG_SUFFIX: &str = "log";

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

pub use tracing_subscriber::filter::LevelFilter as LogLevel;

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogRolling {
    Hourly,
    Daily,
    /// Single append-only file.
    Never,
}

impl From<LogRolling> for Rotation {
    fn from(rolling: LogRolling) -> Self {
        match rolling {
            LogRolling::Hourly => Rotation::HOURLY,
            LogRolling::Daily => Rotation::DAILY,
            LogRolling::Never => Rotation::NEVER,
        }
    }
}

/// Where cache diagnostics go and how much of them is kept.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub directory: PathBuf,
    /// File name prefix; rolled files are named `<prefix>.<date>.log`.
    pub file_prefix: String,
    /// Rolled files kept on startup. `None` keeps everything.
    pub retention: Option<usize>,
    pub file_level: LevelFilter,
    pub console_level: LevelFilter,
    /// Forward `log` crate records into `tracing`.
    pub capture_log: bool,
    /// Filter directive such as `blobcache_core=debug`; falls back to the environment.
    pub env_filter: Option<String>,
    pub rolling: LogRolling,
}

impl Default for LogConfig {
    fn default() -> Self {
        let console_level =
            if cfg!(debug_assertions) { LevelFilter::INFO } else { LevelFilter::WARN };
        Self {
            directory: default_log_directory(),
            file_prefix: "blobcache".to_string(),
            retention: Some(7),
            file_level: LevelFilter::DEBUG,
            console_level,
            capture_log: true,
            env_filter: env_directive(),
            rolling: LogRolling::Daily,
        }
    }
}

impl LogConfig {
    /// Defaults writing log files next to the data of the cache rooted at `root`.
    pub fn for_cache_root(root: impl AsRef<Path>) -> Self {
        Self::default().with_directory(root.as_ref().join(LOG_DIR))
    }

    pub fn with_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory = path.into();
        self
    }

    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    pub fn with_filter<S: Into<String>>(mut self, directive: S) -> Self {
        self.env_filter = Some(directive.into());
        self
    }

    fn directive(&self) -> String {
        self.env_filter
            .clone()
            .or_else(env_directive)
            .unwrap_or_else(|| if cfg!(debug_assertions) { "debug" } else { "info" }.to_string())
    }

    fn file_writer(&self) -> Result<(NonBlocking, WorkerGuard)> {
        let appender = tracing_appender::rolling::Builder::new()
            .rotation(self.rolling.into())
            .filename_prefix(&self.file_prefix)
            .filename_suffix(LOG_SUFFIX)
            .build(&self.directory)
            .with_context(|| format!("opening log files in {}", self.directory.display()))?;
        Ok(tracing_appender::non_blocking(appender))
    }
}

/// Owns the background writer of the file sink; log lines are flushed when it is dropped.
#[derive(Debug)]
pub struct LogHandle {
    _guard: WorkerGuard,
    directory: PathBuf,
    file_prefix: String,
}

impl LogHandle {
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_prefix(&self) -> &str {
        &self.file_prefix
    }
}

/// Install the global subscriber. The first call wins; later calls ignore `config`.
pub fn init(config: LogConfig) -> Result<&'static LogHandle> {
    if let Some(handle) = LOG_HANDLE.get() {
        return Ok(handle);
    }
    let handle = install(config)?;
    Ok(LOG_HANDLE.get_or_init(|| handle))
}

fn install(config: LogConfig) -> Result<LogHandle> {
    if config.capture_log {
        bridge_log_records(config.file_level.max(config.console_level));
    }

    fs::create_dir_all(&config.directory)
        .with_context(|| format!("creating log directory {}", config.directory.display()))?;
    if let Some(keep) = config.retention.filter(|keep| *keep > 0) {
        prune_rolled_files(&config.directory, &config.file_prefix, keep)?;
    }

    let filter = EnvFilter::try_new(config.directive())
        .with_context(|| format!("invalid log filter {:?}", config.directive()))?;
    let (file_writer, guard) = config.file_writer()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(file_writer)
                .with_filter(config.file_level),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(config.console_level),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing cache subscriber: {err}"))?;

    Ok(LogHandle { _guard: guard, directory: config.directory, file_prefix: config.file_prefix })
}

fn env_directive() -> Option<String> {
    ENV_FILTER_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|directive| !directive.trim().is_empty())
}

fn bridge_log_records(max: LevelFilter) {
    let level = match max.into_level() {
        None => log::LevelFilter::Off,
        Some(tracing::Level::ERROR) => log::LevelFilter::Error,
        Some(tracing::Level::WARN) => log::LevelFilter::Warn,
        Some(tracing::Level::INFO) => log::LevelFilter::Info,
        Some(tracing::Level::DEBUG) => log::LevelFilter::Debug,
        Some(_) => log::LevelFilter::Trace,
    };
    if let Err(err) = tracing_log::LogTracer::builder().with_max_level(level).init() {
        debug!(error = %err, "log records already routed elsewhere");
    }
}

/// Delete the oldest rolled files named after `prefix` until `keep` remain. Returns how many
/// were deleted; files that cannot be removed are skipped.
fn prune_rolled_files(dir: &Path, prefix: &str, keep: usize) -> Result<usize> {
    let mut rolled = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("listing log directory {}", dir.display()))?
    {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !is_rolled_file(&path, prefix) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        rolled.push((modified, path));
    }

    let Some(excess) = rolled.len().checked_sub(keep).filter(|excess| *excess > 0) else {
        return Ok(0);
    };
    rolled.sort();
    let mut pruned = 0;
    for (_, path) in rolled.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => pruned += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "stale log file kept"),
        }
    }
    Ok(pruned)
}

fn is_rolled_file(path: &Path, prefix: &str) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(prefix))
}

fn default_log_directory() -> PathBuf {
    directories::ProjectDirs::from("com", "Blobcache", "blobcache")
        .map(|dirs| dirs.data_dir().join(LOG_DIR))
        .unwrap_or_else(|| std::env::temp_dir().join("blobcache-logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let temp = tempfile::tempdir().expect("temp dir");
        let config = LogConfig::for_cache_root(temp.path()).with_prefix("test-log");

        let first = init(config.clone()).expect("init once");
        assert!(first.directory().exists());

        let second = init(config).expect("init twice");
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn pruning_keeps_newest_files() {
        let temp = tempfile::tempdir().expect("temp dir");
        for name in ["cache.1.log", "cache.2.log", "cache.3.log", "other.log"] {
            fs::write(temp.path().join(name), b"line").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        assert_eq!(prune_rolled_files(temp.path(), "cache", 2).unwrap(), 1);
        assert!(!temp.path().join("cache.1.log").exists());
        assert!(temp.path().join("cache.3.log").exists());
        assert!(temp.path().join("other.log").exists());
        assert_eq!(prune_rolled_files(temp.path(), "cache", 2).unwrap(), 0);
    }
}
