//! The denormalized secondary index.
//!
//! One row per alternate-key → primary-key mapping. Index rows are not
//! subject to optimistic concurrency from the caller's point of view: writes
//! are insert-or-replace and deletes use the wildcard match token, so
//! duplicates and retries are idempotent and the last writer wins.
//!
//! A partition may hold a stale row next to the current one (e.g. after a
//! partially failed delete). Callers re-verify every hit against the owning
//! aggregate before trusting it.

use std::sync::Arc;

use idtable_store::{
    query_all, ContinuationToken, MatchToken, StorageError, TableOperation, TableQuery,
    TableStore,
};
use tokio_util::sync::CancellationToken;

use crate::context::IdentityContext;
use crate::error::{IdentityStoreError, Result};
use crate::rows::IndexEntry;

/// One page of index entries.
#[derive(Debug, Default)]
pub struct IndexPage {
    pub entries: Vec<IndexEntry>,
    pub continuation: Option<ContinuationToken>,
}

/// Access to the index table.
#[derive(Clone)]
pub struct IndexTable {
    store: Arc<dyn TableStore>,
    table: String,
}

impl IndexTable {
    pub fn new(store: Arc<dyn TableStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    pub fn from_context(ctx: &IdentityContext) -> Self {
        Self::new(Arc::clone(&ctx.store), ctx.tables.index.clone())
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert or replace one index row.
    pub async fn upsert(&self, entry: &IndexEntry, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        self.put(entry).await
    }

    async fn put(&self, entry: &IndexEntry) -> Result<()> {
        self.store
            .execute(&self.table, TableOperation::InsertOrReplace(entry.to_row()))
            .await?;
        Ok(())
    }

    /// Upsert many rows; each targets its own partition, so each is its own
    /// write. Failures are collected and reported once.
    pub async fn upsert_all(&self, entries: &[IndexEntry], cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(IdentityStoreError::Cancelled);
            }
            if let Err(err) = self.put(entry).await {
                failures.push((format!("{}/{}", entry.partition_key, entry.row_key), storage(err)));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(IdentityStoreError::partial("index upsert", failures))
        }
    }

    /// Delete one index row. A row that is already gone counts as deleted.
    pub async fn delete(
        &self,
        partition_key: &str,
        row_key: &str,
        match_token: MatchToken,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        self.remove(partition_key, row_key, match_token).await
    }

    async fn remove(&self, partition_key: &str, row_key: &str, match_token: MatchToken) -> Result<()> {
        let op = TableOperation::Delete {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            match_token,
        };
        match self.store.execute(&self.table, op).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete many rows with the wildcard token, collecting failures.
    pub async fn delete_all(&self, entries: &[IndexEntry], cancel: &CancellationToken) -> Result<()> {
        let mut failures = Vec::new();
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(IdentityStoreError::Cancelled);
            }
            if let Err(err) = self
                .remove(&entry.partition_key, &entry.row_key, MatchToken::Any)
                .await
            {
                failures.push((format!("{}/{}", entry.partition_key, entry.row_key), storage(err)));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(IdentityStoreError::partial("index delete", failures))
        }
    }

    /// Point lookup of one index row.
    pub async fn query_exact(
        &self,
        partition_key: &str,
        row_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IndexEntry>> {
        if partition_key.is_empty() {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let select: Vec<String> = IndexEntry::PROJECTION.iter().map(|c| c.to_string()).collect();
        let row = self
            .store
            .get(&self.table, partition_key, row_key, Some(&select))
            .await?;
        row.as_ref().map(IndexEntry::from_row).transpose()
    }

    /// One page of an index partition, projected to the owner columns.
    pub async fn query_by_partition(
        &self,
        partition_key: &str,
        page_size: usize,
        continuation: Option<&ContinuationToken>,
        cancel: &CancellationToken,
    ) -> Result<IndexPage> {
        if partition_key.is_empty() {
            return Ok(IndexPage::default());
        }
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let query = Self::partition_query(partition_key).take(page_size.max(1));
        let page = self.store.query(&self.table, &query, continuation).await?;
        let entries = page
            .rows
            .iter()
            .map(IndexEntry::from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(IndexPage {
            entries,
            continuation: page.continuation,
        })
    }

    /// Every entry of an index partition.
    pub async fn query_all_by_partition(
        &self,
        partition_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexEntry>> {
        if partition_key.is_empty() {
            return Ok(Vec::new());
        }
        let rows = query_all(
            self.store.as_ref(),
            &self.table,
            &Self::partition_query(partition_key),
            cancel,
        )
        .await?;
        rows.iter().map(IndexEntry::from_row).collect()
    }

    fn partition_query(partition_key: &str) -> TableQuery {
        TableQuery::partition(partition_key).select(&IndexEntry::PROJECTION)
    }
}

fn storage(err: IdentityStoreError) -> StorageError {
    match err {
        IdentityStoreError::Storage(e) => e,
        other => StorageError::Other(other.to_string()),
    }
}
