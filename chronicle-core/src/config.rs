//! # Configuration Management
//!
//! Node configuration, loadable from a TOML file. Every section has defaults
//! so a partial file is valid.
//!
//! ```toml
//! [db]
//! path = "/var/lib/chronicle"
//! chunk_size = 268435456
//!
//! [index]
//! memtable_max_entries = 1000000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest chunk capacity accepted by [`NodeConfig::validate`].
pub const MIN_CHUNK_SIZE: u64 = 4 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub db: DbConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub writer: WriterConfig,
    pub scavenge: ScavengeConfig,
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Io {
            message: format!("Failed to read config file {:?}", path),
            source: e,
        })?;
        let config: NodeConfig = toml::from_str(&content).map_err(|e| Error::Configuration {
            message: format!("Invalid config file {:?}: {}", path, e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration rooted at `path`.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.db.path = path.into();
        config
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Configuration {
            message: format!("Failed to serialize config: {}", e),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::Configuration {
                message: format!("chunk_size must be at least {} bytes", MIN_CHUNK_SIZE),
            });
        }
        if self.db.chunk_size > u32::MAX as u64 {
            return Err(Error::Configuration {
                message: "chunk_size must fit in 32 bits".to_string(),
            });
        }
        if self.index.memtable_max_entries == 0 {
            return Err(Error::Configuration {
                message: "memtable_max_entries must be positive".to_string(),
            });
        }
        if self.index.max_tables_per_level < 2 {
            return Err(Error::Configuration {
                message: "max_tables_per_level must be at least 2".to_string(),
            });
        }
        if self.cache.stream_info_capacity == 0 || self.writer.stream_version_capacity == 0 {
            return Err(Error::Configuration {
                message: "cache capacities must be positive".to_string(),
            });
        }
        if self.writer.max_batch_size == 0 {
            return Err(Error::Configuration {
                message: "writer max_batch_size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Transaction log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Maximum data bytes per chunk, header and footer excluded.
    pub chunk_size: u64,
    /// Verify the whole-file checksum of every completed chunk on open.
    pub verify_hashes: bool,
    /// Verify the record checksum on every read.
    pub verify_checksums_on_read: bool,
    /// fsync after every write batch.
    pub sync_on_write: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            chunk_size: 256 * 1024 * 1024, // 256MB
            verify_hashes: false,
            verify_checksums_on_read: true,
            sync_on_write: true,
        }
    }
}

/// Table index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Entries held in the memtable before it is flushed to a PTable.
    pub memtable_max_entries: usize,
    /// Tables per level that trigger a merge into the next level.
    pub max_tables_per_level: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            memtable_max_entries: 1_000_000,
            max_tables_per_level: 2,
        }
    }
}

/// Read-side cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub stream_info_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { stream_info_capacity: 100_000 }
    }
}

/// Writer queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub queue_capacity: usize,
    /// Requests sharing one flush.
    pub max_batch_size: usize,
    /// Streams whose current version the writer keeps in memory.
    pub stream_version_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            max_batch_size: 256,
            stream_version_capacity: 100_000,
        }
    }
}

/// Scavenger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScavengeConfig {
    /// Prepares without a commit older than this are discarded.
    pub orphan_prepare_age_secs: u64,
    /// Verify records read from chunks being scavenged.
    pub verify_records: bool,
}

impl ScavengeConfig {
    pub fn orphan_prepare_age(&self) -> Duration {
        Duration::from_secs(self.orphan_prepare_age_secs)
    }
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        Self {
            orphan_prepare_age_secs: 24 * 60 * 60,
            verify_records: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` env-filter directive, e.g. `info,chronicle_storage=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}
