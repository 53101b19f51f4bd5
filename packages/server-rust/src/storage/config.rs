//! Backend selection and tuning.
//!
//! Loading these from a file is the host's job; every type derives
//! `Deserialize` so it can sit inside the host's own configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File name of the YAML backend inside its data directory.
pub const DEFAULT_YAML_FILE: &str = "homes.yml";
/// File name of the `SQLite` database inside its data directory.
pub const DEFAULT_SQLITE_FILE: &str = "homes.db";

/// Which [`HomeStorage`](crate::traits::HomeStorage) backend to open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Single YAML file rewritten on every flush.
    Yaml(YamlConfig),
    /// Pooled `SQLite` database with per-key upserts.
    Sqlite(SqliteConfig),
    /// Nothing survives a restart.
    Memory,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Yaml(YamlConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YamlConfig {
    /// Directory holding the homes file. Created on open.
    pub data_dir: PathBuf,
    pub file_name: String,
}

impl Default for YamlConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            file_name: DEFAULT_YAML_FILE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Directory holding the database file. Created on open.
    pub data_dir: PathBuf,
    pub file_name: String,
    pub pool: PoolConfig,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            file_name: DEFAULT_SQLITE_FILE.to_string(),
            pool: PoolConfig::default(),
        }
    }
}

/// Connection pool sizing for the `SQLite` backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Idle connections kept open.
    pub min_connections: u32,
    /// How long to wait for a free connection before failing.
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are closed.
    pub idle_timeout_ms: u64,
    /// Connections are recycled after this long regardless of use.
    pub max_lifetime_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 300_000,
            max_lifetime_ms: 600_000,
        }
    }
}
