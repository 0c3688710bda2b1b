//! Structured logging for docvault
//!
//! `tracing` events go to stderr in either a human-readable or a JSON-lines
//! format, optionally mirrored into a log file.
//!
//! # Field names
//!
//! Events across the engine use the same field names so JSON logs can be
//! filtered consistently:
//! - `source_id`, `chunk_index`: document identity
//! - `start_slot`, `slots`, `slot`: vector index positions
//! - `path`: snapshot, index or database file
//! - `batch`: pipeline batch sequence number
//!
//! Chunk text is never logged.

use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub use crate::config::LogFormat;
use crate::config::{GeneralConfig, expand_tilde};

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter; `RUST_LOG` takes precedence when set
    pub level: String,

    /// Output format (pretty or json)
    pub format: LogFormat,

    /// Optional log file, appended to
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl From<&GeneralConfig> for LogConfig {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            level: general.log_level.clone(),
            format: general.log_format,
            file: general.log_file.as_deref().map(expand_tilde),
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    let existed = parent.exists();
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    ensure_parent_dir(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    // Validate the configured level so typos fail loudly instead of
    // silently filtering everything.
    level.parse::<LogLevel>().map_err(LogError::InvalidLevel)?;
    Ok(EnvFilter::new(level))
}

/// Initialize the global logging subscriber.
///
/// Call once at startup. A second call returns
/// `Err(LogError::AlreadyInitialized)`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = build_filter(&config.level)?;
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    match config.format {
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_ansi(true);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .with_writer(file)
                    .with_target(true)
                    .with_ansi(false)
            });
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(stderr_layer)
                    .with(file_layer),
            )?;
        }
        LogFormat::Json => {
            let stderr_layer = fmt::layer()
                .json()
                .with_timer(SystemTime)
                .with_writer(io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true);
            let file_layer = file.map(|file| {
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(file)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
            });
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(stderr_layer)
                    .with(file_layer),
            )?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);

    tracing::debug!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

/// Check if logging has been initialized
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Log levels accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Captures subscriber output in a shared buffer
    #[derive(Clone)]
    struct MockLogWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl MockLogWriter {
        fn new() -> Self {
            Self {
                buffer: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for MockLogWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for MockLogWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        let err = "verbose".parse::<LogLevel>().unwrap_err();
        assert!(err.contains("unknown log level: verbose"));
    }

    #[test]
    fn log_level_ordering_and_conversion() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
    }

    #[test]
    fn log_config_from_general() {
        let general = GeneralConfig {
            log_level: "debug".to_string(),
            log_format: LogFormat::Json,
            log_file: Some("/tmp/docvault.log".to_string()),
            data_dir: "/tmp".to_string(),
        };
        let config = LogConfig::from(&general);
        assert_eq!(config.level, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/docvault.log")));
    }

    #[test]
    fn log_config_serde_defaults_from_empty_json() {
        let config: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file.is_none());
    }

    #[test]
    fn json_logs_carry_structured_fields() {
        let writer = MockLogWriter::new();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
                    .with_writer(writer.clone()),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(source_id = "notes/a.txt", start_slot = 7u64, "batch committed");
        });

        let output = writer.contents();
        let line = output.lines().find(|line| !line.trim().is_empty()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(parsed.get("timestamp").is_some());
        assert_eq!(
            parsed.get("source_id").and_then(|v| v.as_str()),
            Some("notes/a.txt")
        );
        assert_eq!(
            parsed.get("start_slot").and_then(serde_json::Value::as_u64),
            Some(7)
        );
    }

    #[test]
    fn pretty_logs_contain_message() {
        let writer = MockLogWriter::new();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(
                fmt::layer()
                    .with_writer(writer.clone())
                    .with_target(true)
                    .with_ansi(false),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("audit finished");
            tracing::debug!("filtered out");
        });

        let output = writer.contents();
        assert!(output.contains("audit finished"));
        assert!(!output.contains("filtered out"));
    }

    #[test]
    fn ensure_parent_dir_creates_nested() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a").join("b").join("file.log");
        ensure_parent_dir(&path).unwrap();
        assert!(tmp.path().join("a").join("b").exists());
        ensure_parent_dir(Path::new("file.log")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn log_file_is_private() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("logs").join("dv.log");
        open_log_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(tmp.path().join("logs"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn log_error_display() {
        assert_eq!(
            LogError::AlreadyInitialized.to_string(),
            "logging already initialized"
        );
        let err: LogError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, LogError::FileCreate(_)));
    }

    // init_logging installs a process-global subscriber, so it is covered
    // by the CLI contract tests rather than here.
}
