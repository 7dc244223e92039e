//! Configuration types for the feature cache.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the feature cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Which storage backend to use.
    #[serde(default)]
    pub backend: BackendKind,

    /// Term scan configuration.
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite database file.
    #[default]
    Sqlite,
    /// Process-local maps; nothing survives a restart.
    Memory,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Enable WAL mode (needed for concurrent readers).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// SQLite cache size (negative = KB, positive = pages).
    #[serde(default = "default_cache_size")]
    pub cache_size: i32,

    /// Busy timeout in milliseconds. Bounds how long any operation waits on a lock.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,

    /// Number of read-only connections for file databases.
    #[serde(default = "default_read_connections")]
    pub read_connections: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            wal_mode: true,
            cache_size: -16000, // 16MB
            busy_timeout_ms: 5000,
            read_connections: 4,
        }
    }
}

/// Term scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Entries fetched per page by term-type scans.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { page_size: 256 }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_cache_size() -> i32 {
    -16000
}

fn default_busy_timeout() -> u32 {
    5000
}

fn default_read_connections() -> usize {
    4
}

fn default_page_size() -> usize {
    256
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("geocache")
        .join("cache.db")
}

impl CacheConfig {
    /// Load configuration from file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> crate::error::Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            crate::error::CacheError::config(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> crate::error::Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("geocache").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("geocache.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        Ok(Self::default())
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.scan.page_size == 0 {
            return Err(crate::error::CacheError::config(
                "scan.page_size must be at least 1",
            ));
        }
        Ok(())
    }
}
