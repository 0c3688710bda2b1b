//! Error types for docvault-core

use std::fmt::Write;
use std::path::PathBuf;

use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for docvault-core
#[derive(Error, Debug)]
pub enum Error {
    /// A vector (or query) does not match the index dimension
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A payload's chunk and vector lists differ in length
    #[error("shape mismatch for {source_id}: {chunks} chunks but {vectors} vectors")]
    ShapeMismatch {
        source_id: String,
        chunks: usize,
        vectors: usize,
    },

    /// Search against an index with no vectors
    #[error("vector index is empty")]
    EmptyIndex,

    /// Truncation beyond the current index size
    #[error("invalid index size {requested} (current size {current})")]
    InvalidSize { requested: usize, current: usize },

    /// Transaction begin/commit/rollback used out of order
    #[error("transaction state error: {0}")]
    TransactionState(String),

    /// The consistency audit found the stores disagreeing
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Snapshot file could not be read or written
    #[error("snapshot I/O failed for {path}: {source}")]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Import input rejected before live state was touched
    #[error("snapshot transfer rejected: {0}")]
    TransferFailure(String),

    /// Import swap failed and restoring the pre-import backup failed too
    #[error("import failed ({original}) and restore from backup failed ({restore})")]
    RestoreFailed { original: String, restore: String },

    /// Batch aborted by a cancellation flag
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Payload content rejected (non-finite values, empty ids, ...)
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Another process holds the data directory
    #[error("data directory is locked by another process: {0}")]
    WorkspaceLocked(PathBuf),

    /// SQLite errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn snapshot_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::SnapshotIo {
            path: path.into(),
            source,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::DimensionMismatch { expected, .. } => Some(
                Remediation::new(format!(
                    "Use an embedder that produces {expected}-dimensional vectors."
                ))
                .alternative("Change storage.dimension and rebuild the index from scratch.")
                .command("Rebuild", "dv rebuild"),
            ),
            Self::ShapeMismatch { .. } | Self::InvalidPayload(_) => Some(
                Remediation::new("Fix the producer so every chunk has exactly one finite vector.")
                    .alternative("Index through the pipeline, which drops malformed items."),
            ),
            Self::ConsistencyViolation(_) => Some(
                Remediation::new("Vector index and metadata disagree; rebuild or compact.")
                    .command("Inspect", "dv audit")
                    .command("Compact", "dv compact")
                    .command("Rebuild", "dv rebuild"),
            ),
            Self::SnapshotIo { .. } | Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and free space, then retry.")
                    .alternative("Verify the destination directory exists and is writable."),
            ),
            Self::TransferFailure(_) => Some(
                Remediation::new("The snapshot is incomplete or corrupt; live data was not touched.")
                    .command("Re-export", "dv export <dir>")
                    .alternative("Check that both snapshot files were copied completely."),
            ),
            Self::RestoreFailed { .. } => Some(
                Remediation::new("Restore manually from the .bak files next to the data files.")
                    .command("Inspect", "dv audit")
                    .alternative("If the backups are unusable, run a full rebuild."),
            ),
            Self::WorkspaceLocked(_) => Some(
                Remediation::new("Stop the other docvault process using this data directory.")
                    .alternative("Point --data-dir at a different directory."),
            ),
            Self::Config(_) => Some(
                Remediation::new("Fix docvault.toml and retry.")
                    .command("Show config", "dv status"),
            ),
            Self::Database(_) => Some(
                Remediation::new("The metadata database reported an error; audit the index.")
                    .command("Inspect", "dv audit"),
            ),
            Self::EmptyIndex
            | Self::InvalidSize { .. }
            | Self::TransactionState(_)
            | Self::Cancelled(_)
            | Self::Json(_) => None,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
