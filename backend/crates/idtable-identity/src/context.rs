//! Shared wiring for every identity component.

use std::sync::Arc;

use idtable_configs::{BatchSettings, IdentityStoreConfig, KeyAlgorithm, QuerySettings};
use idtable_store::{BatchWriter, TableStore};

use crate::error::Result;
use crate::key_helper::{KeyHelper, KeyVersion};

/// Physical table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    /// User aggregates (entity rows and their dependents)
    pub users: String,
    pub index: String,
    /// Role aggregates and the role id index
    pub roles: String,
}

impl Default for TableNames {
    fn default() -> Self {
        let tables = idtable_configs::TableSettings::default();
        Self {
            users: tables.users_table(),
            index: tables.index_table(),
            roles: tables.roles_table(),
        }
    }
}

/// Store handle, key helpers and tuning shared by the identity components.
///
/// Cheap to clone; components hold their own copy.
#[derive(Clone)]
pub struct IdentityContext {
    pub store: Arc<dyn TableStore>,
    pub tables: TableNames,
    /// Helper used for every new write
    pub keys: KeyHelper,
    /// Legacy helper consulted when a lookup under `keys` misses
    pub legacy_keys: Option<KeyHelper>,
    pub query: QuerySettings,
    pub batch: BatchSettings,
}

impl IdentityContext {
    /// Context with default tables and settings, writing SHA-256 keys with
    /// legacy fallback enabled.
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self::from_config(store, &IdentityStoreConfig::default())
    }

    pub fn from_config(store: Arc<dyn TableStore>, config: &IdentityStoreConfig) -> Self {
        let keys = KeyHelper::new(config.keys.algorithm);
        let legacy_keys = (config.keys.legacy_fallback
            && config.keys.algorithm != KeyAlgorithm::Sha1)
            .then(KeyHelper::legacy);
        Self {
            store,
            tables: TableNames {
                users: config.tables.users_table(),
                index: config.tables.index_table(),
                roles: config.tables.roles_table(),
            },
            keys,
            legacy_keys,
            query: config.query.clone(),
            batch: config.batch.clone(),
        }
    }

    pub fn with_query_settings(mut self, query: QuerySettings) -> Self {
        self.query = query;
        self
    }

    pub fn with_keys(mut self, keys: KeyHelper, legacy_keys: Option<KeyHelper>) -> Self {
        self.keys = keys;
        self.legacy_keys = legacy_keys;
        self
    }

    /// Create every table this context uses. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        for table in [&self.tables.users, &self.tables.index, &self.tables.roles] {
            self.store.create_table_if_not_exists(table).await?;
        }
        log::debug!(
            "Identity tables ready on {} backend: {}, {}, {}",
            self.store.backend_name(),
            self.tables.users,
            self.tables.index,
            self.tables.roles
        );
        Ok(())
    }

    /// Helpers to try for lookups, current first.
    pub fn lookup_keys(&self) -> impl Iterator<Item = &KeyHelper> {
        std::iter::once(&self.keys).chain(self.legacy_keys.iter())
    }

    /// Helper that derives keys in the format of `version`.
    pub fn keys_for(&self, version: KeyVersion) -> KeyHelper {
        if version == self.keys.version() {
            self.keys.clone()
        } else {
            match version {
                KeyVersion::Legacy => KeyHelper::legacy(),
                KeyVersion::Current => KeyHelper::current(),
            }
        }
    }

    pub fn batch_writer(&self, table: &str) -> BatchWriter {
        BatchWriter::with_settings(Arc::clone(&self.store), table, &self.batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idtable_store::MemoryTableStore;

    #[tokio::test]
    async fn test_initialize_creates_tables() {
        let store = Arc::new(MemoryTableStore::new());
        let ctx = IdentityContext::new(store.clone());
        ctx.initialize().await.unwrap();
        for table in ["AspNetUsers", "AspNetIndex", "AspNetRoles"] {
            assert!(store.table_exists(table).await.unwrap());
        }
    }

    #[test]
    fn test_lookup_keys_order() {
        let ctx = IdentityContext::new(Arc::new(MemoryTableStore::new()));
        let versions: Vec<_> = ctx.lookup_keys().map(KeyHelper::version).collect();
        assert_eq!(versions, vec![KeyVersion::Current, KeyVersion::Legacy]);

        let mut config = IdentityStoreConfig::default();
        config.keys.legacy_fallback = false;
        let ctx = IdentityContext::from_config(Arc::new(MemoryTableStore::new()), &config);
        assert_eq!(ctx.lookup_keys().count(), 1);

        config.keys.algorithm = KeyAlgorithm::Sha1;
        config.keys.legacy_fallback = true;
        let ctx = IdentityContext::from_config(Arc::new(MemoryTableStore::new()), &config);
        assert_eq!(ctx.lookup_keys().count(), 1);
        assert_eq!(ctx.keys.version(), KeyVersion::Legacy);
    }
}
