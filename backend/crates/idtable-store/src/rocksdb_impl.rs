//! RocksDB implementation of [`TableStore`].
//!
//! Each table is a column family. Rows are stored under
//! `partition_key 0x00 row_key` with a JSON-encoded body (properties, ETag,
//! timestamp). Keys never contain control characters, so byte order of the
//! encoded key equals `(partition key, row key)` order.
//!
//! RocksDB calls are synchronous; every trait method runs them on the
//! blocking pool via `tokio::task::spawn_blocking`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch};

use crate::error::{Result, StorageError};
use crate::operation::{self, OperationOutcome, TableOperation};
use crate::query::{ContinuationToken, QueryPage, TableQuery};
use crate::rocksdb_init::RocksDb;
use crate::row::{StoredRow, TableRow};
use crate::storage_trait::TableStore;

const KEY_SEPARATOR: u8 = 0x00;

fn encode_key(partition_key: &str, row_key: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(partition_key.len() + row_key.len() + 1);
    key.extend_from_slice(partition_key.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(row_key.as_bytes());
    key
}

fn decode_key(key: &[u8]) -> Result<(String, String)> {
    let split = key
        .iter()
        .position(|b| *b == KEY_SEPARATOR)
        .ok_or_else(|| StorageError::Serialization("row key without separator".to_string()))?;
    let pk = std::str::from_utf8(&key[..split])
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let rk = std::str::from_utf8(&key[split + 1..])
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok((pk.to_string(), rk.to_string()))
}

/// RocksDB-backed table store.
#[derive(Clone)]
pub struct RocksTableStore {
    db: Arc<RocksDb>,
    max_page_size: usize,
    /// Serializes read-check-write of conditional batches
    write_lock: Arc<Mutex<()>>,
}

impl RocksTableStore {
    pub const DEFAULT_MAX_PAGE_SIZE: usize = 1000;

    pub fn new(db: Arc<RocksDb>) -> Self {
        Self::with_max_page_size(db, Self::DEFAULT_MAX_PAGE_SIZE)
    }

    pub fn with_max_page_size(db: Arc<RocksDb>, max_page_size: usize) -> Self {
        Self {
            db,
            max_page_size: max_page_size.max(1),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn db(&self) -> &Arc<RocksDb> {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(RocksTableStore) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| StorageError::Other(format!("blocking task failed: {}", e)))?
    }

    fn read_row(&self, table: &str, partition_key: &str, row_key: &str) -> Result<Option<StoredRow>> {
        let cf = self
            .db
            .cf_handle(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        match self.db.get_cf(&cf, encode_key(partition_key, row_key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn query_sync(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<QueryPage> {
        let cf = self
            .db
            .cf_handle(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;

        let limit = query
            .take
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);
        let partition_keys = query.partition_keys();
        let first_pk = match partition_keys.first() {
            Some(pk) => *pk,
            None => return Ok(QueryPage::default()),
        };
        let start = match continuation {
            Some(token) => encode_key(&token.next_partition_key, &token.next_row_key),
            None => encode_key(first_pk, query.row_keys.lower_bound()),
        };

        let mut page = QueryPage::default();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            let (pk, rk) = decode_key(&key)?;
            if query.is_past_end(&pk, &rk) {
                break;
            }
            if !query.matches(&pk, &rk) {
                continue;
            }
            if page.rows.len() == limit {
                page.continuation = Some(ContinuationToken {
                    next_partition_key: pk,
                    next_row_key: rk,
                });
                break;
            }
            let stored: StoredRow = serde_json::from_slice(&value)?;
            page.rows
                .push(stored.to_row(&pk, &rk).project(query.select.as_deref()));
        }
        Ok(page)
    }

    fn submit_sync(&self, table: &str, operations: &[TableOperation]) -> Result<Vec<OperationOutcome>> {
        let _guard = self.write_lock.lock();
        let cf = self
            .db
            .cf_handle(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;

        let mut batch = WriteBatch::default();
        let mut outcomes = Vec::with_capacity(operations.len());
        for op in operations {
            let (pk, rk) = (op.partition_key(), op.row_key());
            let existing = self.read_row(table, pk, rk)?;
            let key = encode_key(pk, rk);
            let etag = match operation::apply(existing.as_ref(), op)? {
                Some(stored) => {
                    batch.put_cf(&cf, &key, serde_json::to_vec(&stored)?);
                    Some(stored.etag)
                }
                None => {
                    batch.delete_cf(&cf, &key);
                    None
                }
            };
            outcomes.push(OperationOutcome {
                partition_key: pk.to_string(),
                row_key: rk.to_string(),
                etag,
            });
        }
        self.db.write(batch)?;
        Ok(outcomes)
    }
}

#[async_trait]
impl TableStore for RocksTableStore {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.blocking(move |this| {
            if this.db.cf_handle(&table).is_some() {
                return Ok(());
            }
            match this.db.create_cf(&table, &Options::default()) {
                Ok(()) => {
                    log::info!("Created table '{}'", table);
                    Ok(())
                }
                // Benign race: created concurrently between check and create
                Err(e) if e.to_string().to_lowercase().contains("column family already exists") => {
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.db.cf_handle(table).is_some())
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        select: Option<&[String]>,
    ) -> Result<Option<TableRow>> {
        let (table, pk, rk) = (table.to_string(), partition_key.to_string(), row_key.to_string());
        let select = select.map(|s| s.to_vec());
        self.blocking(move |this| {
            Ok(this
                .read_row(&table, &pk, &rk)?
                .map(|stored| stored.to_row(&pk, &rk).project(select.as_deref())))
        })
        .await
    }

    async fn query(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<QueryPage> {
        let table = table.to_string();
        let query = query.clone();
        let continuation = continuation.cloned();
        self.blocking(move |this| this.query_sync(&table, &query, continuation.as_ref()))
            .await
    }

    async fn submit_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> Result<Vec<OperationOutcome>> {
        operation::validate_batch(&operations)?;
        let table = table.to_string();
        self.blocking(move |this| this.submit_sync(&table, &operations))
            .await
    }

    fn backend_name(&self) -> &'static str {
        "rocksdb"
    }
}
