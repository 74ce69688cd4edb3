use super::defaults::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main identity store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityStoreConfig {
    #[serde(default)]
    pub tables: TableSettings,
    #[serde(default)]
    pub keys: KeySettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Physical table names.
///
/// The final name of each table is `prefix + name`, which lets several
/// deployments share one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSettings {
    #[serde(default = "default_table_prefix")]
    pub prefix: String,
    #[serde(default = "default_users_table")]
    pub users: String,
    #[serde(default = "default_index_table")]
    pub index: String,
    #[serde(default = "default_roles_table")]
    pub roles: String,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            prefix: default_table_prefix(),
            users: default_users_table(),
            index: default_index_table(),
            roles: default_roles_table(),
        }
    }
}

impl TableSettings {
    pub fn users_table(&self) -> String {
        format!("{}{}", self.prefix, self.users)
    }

    pub fn index_table(&self) -> String {
        format!("{}{}", self.prefix, self.index)
    }

    pub fn roles_table(&self) -> String {
        format!("{}{}", self.prefix, self.roles)
    }

    /// All physical table names, in creation order.
    pub fn all_tables(&self) -> Vec<String> {
        vec![self.users_table(), self.index_table(), self.roles_table()]
    }
}

/// Hash algorithm used to derive partition and row keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// Legacy format, kept so previously written keys keep resolving.
    Sha1,
    Sha256,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::Sha256
    }
}

/// Key derivation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySettings {
    #[serde(default)]
    pub algorithm: KeyAlgorithm,
    /// Retry alternate-key lookups under the legacy SHA-1 keys when the
    /// current algorithm finds nothing.
    #[serde(default = "default_true")]
    pub legacy_fallback: bool,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::default(),
            legacy_fallback: true,
        }
    }
}

/// How fan-out resolves the owners found on one index page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutStrategy {
    /// One aggregate read per owner.
    PerKey,
    /// One combined OR filter per group of owners.
    Combined,
}

impl Default for FanoutStrategy {
    fn default() -> Self {
        FanoutStrategy::Combined
    }
}

/// Fan-out query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Rows requested per index page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Aggregate-read batches allowed in flight at once
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    /// Partition keys combined into one OR filter (store limit: 50)
    #[serde(default = "default_max_filter_partitions")]
    pub max_filter_partitions: usize,
    #[serde(default)]
    pub strategy: FanoutStrategy,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            max_filter_partitions: default_max_filter_partitions(),
            strategy: FanoutStrategy::default(),
        }
    }
}

/// Batch writer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Operations per atomic batch (store limit: 100)
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Partitions submitted in parallel
    #[serde(default = "default_max_concurrent_partitions")]
    pub max_concurrent_partitions: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_concurrent_partitions: default_max_concurrent_partitions(),
        }
    }
}

/// Which table store implementation backs the identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    Rocksdb,
}

impl Default for StorageBackendKind {
    fn default() -> Self {
        StorageBackendKind::Rocksdb
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackendKind,
    #[serde(default = "default_data_path")]
    pub data_path: String,
    /// Maximum rows returned by one query page
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default)]
    pub rocksdb: RocksDbSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            data_path: default_data_path(),
            max_page_size: default_max_page_size(),
            rocksdb: RocksDbSettings::default(),
        }
    }
}

/// RocksDB tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbSettings {
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default = "default_max_write_buffers")]
    pub max_write_buffers: i32,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: i32,
}

impl Default for RocksDbSettings {
    fn default() -> Self {
        Self {
            write_buffer_size: default_write_buffer_size(),
            max_write_buffers: default_max_write_buffers(),
            max_open_files: default_max_open_files(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_true")]
    pub log_to_console: bool,
    #[serde(default = "default_log_file")]
    pub file_path: String,
    /// Optional per-target log level overrides
    /// [logging.targets]
    /// idtable_store = "debug"
    #[serde(default)]
    pub targets: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_to_console: true,
            file_path: default_log_file(),
            targets: HashMap::new(),
        }
    }
}
