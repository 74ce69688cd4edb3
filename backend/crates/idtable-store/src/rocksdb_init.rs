//! RocksDB initialization for the identity tables.
//!
//! Opens (or creates) the database with one column family per table, so
//! tables named in configuration exist before the first request.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use idtable_configs::RocksDbSettings;
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};

/// Database handle type used by the RocksDB backend.
pub type RocksDb = DBWithThreadMode<MultiThreaded>;

/// RocksDB initializer.
pub struct RocksDbInit {
    db_path: String,
    settings: RocksDbSettings,
}

impl RocksDbInit {
    pub fn new(db_path: impl Into<String>, settings: RocksDbSettings) -> Self {
        Self {
            db_path: db_path.into(),
            settings,
        }
    }

    pub fn with_defaults(db_path: impl Into<String>) -> Self {
        Self::new(db_path, RocksDbSettings::default())
    }

    /// Open or create the database and ensure a column family exists for
    /// every name in `tables`.
    pub fn open(&self, tables: &[String]) -> Result<Arc<RocksDb>> {
        let path = Path::new(&self.db_path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(self.settings.max_open_files);
        apply_cf_settings(&mut db_opts, &self.settings);

        let mut existing = match RocksDb::list_cf(&db_opts, path) {
            Ok(cfs) if !cfs.is_empty() => cfs,
            _ => vec!["default".to_string()],
        };
        for table in tables {
            if !existing.iter().any(|n| n == table) {
                existing.push(table.clone());
            }
        }

        let cf_descriptors: Vec<_> = existing
            .iter()
            .map(|name| {
                let mut cf_opts = Options::default();
                apply_cf_settings(&mut cf_opts, &self.settings);
                ColumnFamilyDescriptor::new(name, cf_opts)
            })
            .collect();

        let db = RocksDb::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        log::info!(
            "Opened RocksDB at {} with {} column families",
            self.db_path,
            existing.len()
        );
        Ok(Arc::new(db))
    }
}

pub(crate) fn apply_cf_settings(cf_opts: &mut Options, settings: &RocksDbSettings) {
    cf_opts.set_write_buffer_size(settings.write_buffer_size);
    cf_opts.set_max_write_buffer_number(settings.max_write_buffers);
}
