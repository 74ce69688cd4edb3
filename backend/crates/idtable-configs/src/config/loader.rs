use super::types::{IdentityStoreConfig, KeyAlgorithm};
use crate::file_helpers::normalize_dir_path;
use std::fs;
use std::path::Path;

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl IdentityStoreConfig {
    /// Load configuration from a TOML file
    ///
    /// Note: Environment overrides are applied separately via `apply_env_overrides()`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and finalize it.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: IdentityStoreConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;

        config.finalize()?;

        Ok(config)
    }

    /// Apply `IDTABLE_*` environment variable overrides.
    ///
    /// - `IDTABLE_DATA_PATH`
    /// - `IDTABLE_LOG_LEVEL`
    /// - `IDTABLE_KEY_ALGORITHM` (`sha1` | `sha256`)
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(path) = std::env::var("IDTABLE_DATA_PATH") {
            self.storage.data_path = path;
        }
        if let Ok(level) = std::env::var("IDTABLE_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Ok(algorithm) = std::env::var("IDTABLE_KEY_ALGORITHM") {
            self.keys.algorithm = match algorithm.to_lowercase().as_str() {
                "sha1" => KeyAlgorithm::Sha1,
                "sha256" => KeyAlgorithm::Sha256,
                other => {
                    return Err(anyhow::anyhow!(
                        "Invalid IDTABLE_KEY_ALGORITHM '{}'. Must be sha1 or sha256",
                        other
                    ))
                }
            };
        }
        Ok(())
    }

    /// Normalize local filesystem paths and validate configuration.
    ///
    /// Call this after applying environment overrides.
    pub fn finalize(&mut self) -> anyhow::Result<()> {
        self.storage.data_path = normalize_dir_path(&self.storage.data_path);

        self.validate()?;

        Ok(())
    }

    /// Validate configuration settings
    pub fn validate(&self) -> anyhow::Result<()> {
        // Table names must be present and distinct
        let tables = self.tables.all_tables();
        for (name, raw) in tables.iter().zip([
            &self.tables.users,
            &self.tables.index,
            &self.tables.roles,
        ]) {
            if raw.trim().is_empty() {
                return Err(anyhow::anyhow!("Table name cannot be empty (resolved '{}')", name));
            }
        }
        let mut sorted = tables.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != tables.len() {
            return Err(anyhow::anyhow!("Table names must be unique: {:?}", tables));
        }

        if self.query.page_size == 0 {
            return Err(anyhow::anyhow!("query.page_size cannot be 0"));
        }
        if self.query.max_concurrent_batches == 0 {
            return Err(anyhow::anyhow!("query.max_concurrent_batches cannot be 0"));
        }
        if self.query.max_filter_partitions == 0 || self.query.max_filter_partitions > 50 {
            return Err(anyhow::anyhow!(
                "query.max_filter_partitions must be between 1 and 50 (got {})",
                self.query.max_filter_partitions
            ));
        }

        if self.batch.max_batch_size == 0 || self.batch.max_batch_size > 100 {
            return Err(anyhow::anyhow!(
                "batch.max_batch_size must be between 1 and 100 (got {})",
                self.batch.max_batch_size
            ));
        }
        if self.batch.max_concurrent_partitions == 0 {
            return Err(anyhow::anyhow!("batch.max_concurrent_partitions cannot be 0"));
        }

        if self.storage.max_page_size == 0 {
            return Err(anyhow::anyhow!("storage.max_page_size cannot be 0"));
        }

        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            ));
        }

        let valid_formats = ["compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        for (target, level) in &self.logging.targets {
            if !VALID_LEVELS.contains(&level.as_str()) {
                return Err(anyhow::anyhow!(
                    "Invalid log level '{}' for target '{}'. Must be one of: {}",
                    level,
                    target,
                    VALID_LEVELS.join(", ")
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{FanoutStrategy, StorageBackendKind};
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = IdentityStoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tables.users_table(), "AspNetUsers");
        assert_eq!(config.keys.algorithm, KeyAlgorithm::Sha256);
        assert_eq!(config.query.page_size, 100);
        assert_eq!(config.query.max_concurrent_batches, 10);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = IdentityStoreConfig::from_toml_str("").unwrap();
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.query.strategy, FanoutStrategy::Combined);
        assert!(config.keys.legacy_fallback);
    }

    #[test]
    fn test_parse_full_file() {
        let toml = r#"
            [tables]
            prefix = "test"
            [keys]
            algorithm = "sha1"
            legacy_fallback = false
            [query]
            page_size = 30
            strategy = "per_key"
            [storage]
            backend = "memory"
            data_path = "/tmp/idtable"
            [logging]
            level = "debug"
            [logging.targets]
            idtable_store = "trace"
        "#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = IdentityStoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tables.index_table(), "testAspNetIndex");
        assert_eq!(config.keys.algorithm, KeyAlgorithm::Sha1);
        assert!(!config.keys.legacy_fallback);
        assert_eq!(config.query.page_size, 30);
        assert_eq!(config.query.strategy, FanoutStrategy::PerKey);
        assert_eq!(config.storage.backend, StorageBackendKind::Memory);
        assert_eq!(config.storage.data_path, "/tmp/idtable");
        assert_eq!(config.logging.targets.get("idtable_store").unwrap(), "trace");
    }

    #[test]
    fn test_invalid_filter_partitions() {
        let mut config = IdentityStoreConfig::default();
        config.query.max_filter_partitions = 51;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_batch_size() {
        let mut config = IdentityStoreConfig::default();
        config.batch.max_batch_size = 101;
        assert!(config.validate().is_err());
        config.batch.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_table_names() {
        let mut config = IdentityStoreConfig::default();
        config.tables.roles = config.tables.users.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = IdentityStoreConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let result = IdentityStoreConfig::from_toml_str("[keys]\nalgorithm = \"md5\"\n");
        assert!(result.is_err());
    }
}
