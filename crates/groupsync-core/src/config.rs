//! Configuration module for groupsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for groupsync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub transfer: TransferConfig,
    pub conflicts: ConflictsConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Path of the SQLite database holding the sync state.
    pub state_db: PathBuf,
    /// Directory downloaded file content is written to.
    pub download_dir: PathBuf,
    /// Upper bound on master-version conflict retries within one pass.
    pub max_master_version_retries: u32,
    /// Seconds a network result cache entry is kept before it is discarded.
    pub network_cache_ttl_secs: u64,
}

/// Transfer settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// File transfers smaller than this many bytes skip the network result
    /// cache. `0` caches every transfer.
    pub background_threshold_bytes: u64,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Default conflict strategy: `manual`, `accept_remote`, or `keep_local`.
    pub default_strategy: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/groupsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("groupsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("groupsync");
        Self {
            state_db: data_dir.join("state.db"),
            download_dir: data_dir.join("downloads"),
            max_master_version_retries: 10,
            network_cache_ttl_secs: 86_400,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            default_strategy: "manual".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.max_master_version_retries"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `conflicts.default_strategy`.
pub const VALID_CONFLICT_STRATEGIES: &[&str] = &["manual", "accept_remote", "keep_local"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if self.sync.max_master_version_retries == 0 {
            errors.push(ValidationError {
                field: "sync.max_master_version_retries".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.network_cache_ttl_secs == 0 {
            errors.push(ValidationError {
                field: "sync.network_cache_ttl_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.download_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "sync.download_dir".into(),
                message: "must not be empty".into(),
            });
        }
        if self.sync.state_db.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "sync.state_db".into(),
                message: "must not be empty".into(),
            });
        }

        // --- conflicts ---
        if !VALID_CONFLICT_STRATEGIES.contains(&self.conflicts.default_strategy.as_str()) {
            errors.push(ValidationError {
                field: "conflicts.default_strategy".into(),
                message: format!(
                    "invalid strategy '{}'; valid options: {}",
                    self.conflicts.default_strategy,
                    VALID_CONFLICT_STRATEGIES.join(", ")
                ),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use groupsync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_download_dir(PathBuf::from("/var/lib/app/downloads"))
///     .sync_max_master_version_retries(3)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_state_db(mut self, path: PathBuf) -> Self {
        self.config.sync.state_db = path;
        self
    }

    pub fn sync_download_dir(mut self, path: PathBuf) -> Self {
        self.config.sync.download_dir = path;
        self
    }

    pub fn sync_max_master_version_retries(mut self, n: u32) -> Self {
        self.config.sync.max_master_version_retries = n;
        self
    }

    pub fn sync_network_cache_ttl_secs(mut self, seconds: u64) -> Self {
        self.config.sync.network_cache_ttl_secs = seconds;
        self
    }

    // --- transfer ---

    pub fn transfer_background_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.transfer.background_threshold_bytes = bytes;
        self
    }

    // --- conflicts ---

    pub fn conflicts_default_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.config.conflicts.default_strategy = strategy.into();
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
