//! Startup: configuration loading and store wiring.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use idtable_configs::{IdentityStoreConfig, StorageBackendKind};
use idtable_identity::IdentityContext;
use idtable_store::{MemoryTableStore, RocksDbInit, RocksTableStore, TableStore};
use log::{info, warn};

/// Load the configuration file, falling back to defaults when it is
/// missing, then apply `IDTABLE_*` overrides and the command-line data path.
pub fn load_config(path: &Path, data_path: Option<&str>) -> Result<IdentityStoreConfig> {
    let mut config = if path.exists() {
        IdentityStoreConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        IdentityStoreConfig::default()
    };

    config.apply_env_overrides()?;
    if let Some(data_path) = data_path {
        config.storage.data_path = data_path.to_string();
    }
    config.finalize()?;

    Ok(config)
}

/// Open the configured table store and create the identity tables.
pub async fn bootstrap(config: &IdentityStoreConfig) -> Result<IdentityContext> {
    let store: Arc<dyn TableStore> = match config.storage.backend {
        StorageBackendKind::Rocksdb => {
            let db = RocksDbInit::new(&config.storage.data_path, config.storage.rocksdb.clone())
                .open(&config.tables.all_tables())
                .with_context(|| format!("Failed to open RocksDB at {}", config.storage.data_path))?;
            info!("Opened RocksDB at {}", config.storage.data_path);
            Arc::new(RocksTableStore::with_max_page_size(db, config.storage.max_page_size))
        }
        StorageBackendKind::Memory => {
            warn!("Using the in-memory backend; nothing will be persisted");
            Arc::new(MemoryTableStore::with_max_page_size(config.storage.max_page_size))
        }
    };

    let ctx = IdentityContext::from_config(store, config);
    ctx.initialize().await?;

    info!(
        "Identity store ready: keys={:?}, legacy fallback={}",
        ctx.keys.version(),
        ctx.legacy_keys.is_some()
    );
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml"), Some("/tmp/idtable-test")).unwrap();
        assert_eq!(config.tables.users_table(), "AspNetUsers");
        assert_eq!(config.storage.data_path, "/tmp/idtable-test");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[batch]\nmax_batch_size = 500\n").unwrap();
        assert!(load_config(file.path(), None).is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_rocksdb_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("db");
        let config = load_config(&dir.path().join("absent.toml"), data_path.to_str()).unwrap();

        let ctx = bootstrap(&config).await.unwrap();
        assert_eq!(ctx.store.backend_name(), "rocksdb");
        for table in config.tables.all_tables() {
            assert!(ctx.store.table_exists(&table).await.unwrap());
        }
    }
}
