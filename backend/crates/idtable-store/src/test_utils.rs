//! Test utilities for idtable-store.
//!
//! Helpers for setting up stores with their tables created, with minimal
//! boilerplate.

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use crate::memory_impl::MemoryTableStore;
use crate::rocksdb_impl::RocksTableStore;
use crate::rocksdb_init::RocksDbInit;
use crate::storage_trait::TableStore;

/// Create an in-memory store with `tables` already created.
pub async fn memory_store(tables: &[&str]) -> Result<Arc<MemoryTableStore>> {
    memory_store_with(MemoryTableStore::new(), tables).await
}

/// Create the given tables on a preconfigured in-memory store.
pub async fn memory_store_with(
    store: MemoryTableStore,
    tables: &[&str],
) -> Result<Arc<MemoryTableStore>> {
    let store = Arc::new(store);
    for table in tables {
        store.create_table_if_not_exists(table).await?;
    }
    Ok(store)
}

/// RocksDB-backed store in a temporary directory, removed on drop.
pub struct TestRocksStore {
    pub store: Arc<RocksTableStore>,
    /// Temporary directory (kept alive for the duration of the test)
    #[allow(dead_code)]
    temp_dir: TempDir,
}

impl TestRocksStore {
    /// Open a fresh database with one column family per table.
    ///
    /// ```no_run
    /// use idtable_store::test_utils::TestRocksStore;
    ///
    /// let test_store = TestRocksStore::new(&["AspNetUsers", "AspNetIndex"]).unwrap();
    /// ```
    pub fn new(tables: &[&str]) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        let db = RocksDbInit::with_defaults(temp_dir.path().to_string_lossy().to_string())
            .open(&tables)?;
        Ok(Self {
            store: Arc::new(RocksTableStore::new(db)),
            temp_dir,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_creates_tables() {
        let store = memory_store(&["a", "b"]).await.unwrap();
        assert!(store.table_exists("a").await.unwrap());
        assert!(store.table_exists("b").await.unwrap());
        assert!(!store.table_exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_rocks_store_creates_tables() {
        let test_store = TestRocksStore::new(&["users"]).unwrap();
        assert!(test_store.store.table_exists("users").await.unwrap());
        assert!(test_store.path().exists());
    }
}
