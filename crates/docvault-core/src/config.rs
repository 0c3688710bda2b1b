//! Configuration management for docvault
//!
//! Handles loading and validation of `docvault.toml` configuration files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "DOCVAULT_CONFIG";

/// Config file name looked up under the platform config directory.
pub const CONFIG_FILE_NAME: &str = "docvault.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Indexing settings
    #[serde(default)]
    pub indexing: IndexingConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<String>,

    /// Data directory holding the vector file and metadata database
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    "~/.local/share/docvault".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Fixed embedding dimension of the vector index
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Vector index file name (relative to data_dir)
    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Metadata database file name (relative to data_dir)
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,

    /// Compact automatically after a directory removal once tombstoned
    /// slots exceed this fraction of the index. 0 disables.
    #[serde(default)]
    pub auto_compact_ratio: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            index_file: default_index_file(),
            metadata_file: default_metadata_file(),
            auto_compact_ratio: 0.0,
        }
    }
}

fn default_dimension() -> usize {
    384
}

fn default_index_file() -> String {
    "vectors.dvvi".to_string()
}

fn default_metadata_file() -> String {
    "documents.db".to_string()
}

/// Indexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Payloads per atomic insert batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Chunk size in characters for the built-in text parser
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between consecutive chunks in characters
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// File extensions picked up by directory scans
    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            file_extensions: default_file_extensions(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_chunk_size() -> usize {
    512
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_file_extensions() -> Vec<String> {
    vec![".txt".to_string(), ".md".to_string()]
}

impl Config {
    /// Load configuration, resolving the file location.
    ///
    /// Order: explicit path, `$DOCVAULT_CONFIG`, the platform config
    /// directory, then built-in defaults.
    pub fn load(explicit: Option<&Path>) -> crate::Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::debug!("No config file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Serialize to TOML text.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.dimension == 0 {
            return Err(ConfigError::ValidationError(
                "storage.dimension must be > 0".to_string(),
            ));
        }
        if self.indexing.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "indexing.batch_size must be > 0".to_string(),
            ));
        }
        if self.indexing.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "indexing.chunk_size must be > 0".to_string(),
            ));
        }
        if self.indexing.chunk_overlap >= self.indexing.chunk_size {
            return Err(ConfigError::ValidationError(format!(
                "indexing.chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.indexing.chunk_overlap, self.indexing.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.storage.auto_compact_ratio) {
            return Err(ConfigError::ValidationError(
                "storage.auto_compact_ratio must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.general.data_dir)
    }

    /// Resolved vector index file path.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir().join(&self.storage.index_file)
    }

    /// Resolved metadata database path.
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir().join(&self.storage.metadata_file)
    }

    /// Config rooted at `data_dir`, everything else default. Used by tests
    /// and by `--data-dir` overrides.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl AsRef<Path>) -> Self {
        self.general.data_dir = data_dir.as_ref().display().to_string();
        self
    }

    /// Same config with a different vector dimension.
    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.storage.dimension = dimension;
        self
    }
}

/// Locate the config file to load, if any.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(raw) = std::env::var(CONFIG_ENV_VAR) {
        if !raw.trim().is_empty() {
            return Some(expand_tilde(&raw));
        }
    }
    let candidate = dirs::config_dir()?.join("docvault").join(CONFIG_FILE_NAME);
    candidate.exists().then_some(candidate)
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    }
    PathBuf::from(path)
}
