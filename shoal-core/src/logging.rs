//! Log sinks for Shoal processes.
//!
//! Events go to the console, filtered to the operator's level, and to a trace
//! file that keeps every event of the current run. The file is truncated when
//! a process starts.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tracing_fmt};

/// Trace file written inside the logs directory unless overridden.
pub const DEFAULT_LOG_FILE: &str = "shoal.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Cannot open trace file {}: {source}", path.display())]
    TraceFile { path: PathBuf, source: io::Error },

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Where log output goes and how much of it reaches the console.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub console_level: Level,
    pub logs_dir: PathBuf,
    pub file_name: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            console_level: Level::INFO,
            logs_dir: PathBuf::from("logs"),
            file_name: DEFAULT_LOG_FILE.to_string(),
        }
    }
}

impl LogOptions {
    pub fn new(console_level: Level) -> Self {
        Self {
            console_level,
            ..Self::default()
        }
    }

    pub fn with_logs_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = logs_dir.into();
        self
    }

    pub fn trace_file(&self) -> PathBuf {
        self.logs_dir.join(&self.file_name)
    }

    /// Installs the global subscriber and returns the trace file path.
    ///
    /// `RUST_LOG`, when set, replaces the console filter. The trace file
    /// always records every level.
    ///
    /// # Errors
    ///
    /// - `LoggingError::TraceFile` - If the directory or file cannot be created
    /// - `LoggingError::AlreadyInstalled` - If called twice in one process
    pub fn install(&self) -> Result<PathBuf, LoggingError> {
        let path = self.trace_file();
        let file = open_trace_file(&path)?;

        tracing_subscriber::registry()
            .with(vec![console_layer(self.console_level), file_layer(file)])
            .try_init()?;

        tracing::debug!("Writing trace log to {}", path.display());
        Ok(path)
    }
}

fn open_trace_file(path: &Path) -> Result<File, LoggingError> {
    let create = || {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        File::create(path)
    };
    create().map_err(|source| LoggingError::TraceFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Our crates at `level`, dependencies only when they warn.
fn console_directives(level: Level) -> String {
    let level = level.to_string().to_lowercase();
    format!("warn,shoal={level},shoal_core={level}")
}

fn console_layer(level: Level) -> BoxedLayer {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(level)));

    tracing_fmt::layer()
        .compact()
        .with_target(false)
        .with_filter(filter)
        .boxed()
}

fn file_layer(file: File) -> BoxedLayer {
    tracing_fmt::layer()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(Arc::new(file))
        .boxed()
}

/// Console verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    /// Conn lifecycle and blacklist decisions
    Debug,
    /// Every frame sent and received
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_cli_level_maps_to_tracing_level() {
        assert_eq!(CliLogLevel::from_str("WARN", true), Ok(CliLogLevel::Warn));
        assert!(CliLogLevel::from_str("loud", true).is_err());
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
        assert_eq!(Level::from(CliLogLevel::Debug), Level::DEBUG);
    }

    #[test]
    fn test_console_quiets_dependencies() {
        assert_eq!(
            console_directives(Level::DEBUG),
            "warn,shoal=debug,shoal_core=debug"
        );
    }

    #[test]
    fn test_trace_file_is_created_and_truncated() {
        let temp = tempfile::tempdir().unwrap();
        let options = LogOptions::new(Level::INFO).with_logs_dir(temp.path().join("nested"));
        let path = options.trace_file();
        assert_eq!(path, temp.path().join("nested").join(DEFAULT_LOG_FILE));

        let mut file = open_trace_file(&path).unwrap();
        file.write_all(b"previous run").unwrap();
        drop(file);

        open_trace_file(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_unwritable_logs_dir_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();

        let options = LogOptions::default().with_logs_dir(&blocker);
        match open_trace_file(&options.trace_file()) {
            Err(LoggingError::TraceFile { path, .. }) => assert!(path.starts_with(&blocker)),
            other => panic!("expected trace file error, got {other:?}"),
        }
    }
}
