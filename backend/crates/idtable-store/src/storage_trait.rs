//! Table store abstraction.
//!
//! Every persistence backend (RocksDB on disk, in-memory for tests) exposes the
//! same narrow surface a partitioned table service offers, so the identity
//! layer never depends on a concrete backend.
//!
//! ## Table Model
//!
//! - **Table**: named collection of rows (a column family in RocksDB)
//! - **Partition key**: unit of atomicity; a batch never spans two partitions
//! - **Row key**: ordered within a partition; range scans use it
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use idtable_store::{TableStore, TableQuery, TableOperation, TableRow};
//!
//! async fn store_claim(store: &dyn TableStore) -> idtable_store::Result<()> {
//!     let row = TableRow::new("N_abc", "C_def").with("ClaimType", "role");
//!     store.execute("users", TableOperation::InsertOrReplace(row)).await?;
//!     let page = store
//!         .query("users", &TableQuery::partition("N_abc").row_key_range("C_", "D_"), None)
//!         .await?;
//!     assert_eq!(page.rows.len(), 1);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StorageError};
use crate::operation::{OperationOutcome, TableOperation};
use crate::query::{ContinuationToken, TableQuery};
use crate::row::TableRow;

/// Store limit on operations in one atomic batch.
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// Partitioned table store.
///
/// Implementations must be thread-safe; one instance is shared across all
/// concurrent identity operations.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create a table if it does not exist yet. Idempotent.
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Point read. `select` limits the returned properties.
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        select: Option<&[String]>,
    ) -> Result<Option<TableRow>>;

    /// One page of an ordered query.
    ///
    /// Rows come back in `(partition key, row key)` order. A page holds at most
    /// `query.take` rows (capped by the backend's page size). When
    /// `continuation` is set on the returned page, passing it back resumes
    /// right after the last returned row.
    async fn query(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<crate::query::QueryPage>;

    /// Apply operations atomically: all of them or none.
    ///
    /// All operations must target the same partition, touch distinct rows,
    /// and number between 1 and [`MAX_BATCH_OPERATIONS`].
    async fn submit_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> Result<Vec<OperationOutcome>>;

    /// Apply one operation.
    async fn execute(&self, table: &str, operation: TableOperation) -> Result<OperationOutcome> {
        let mut outcomes = self.submit_batch(table, vec![operation]).await?;
        outcomes
            .pop()
            .ok_or_else(|| StorageError::Other("batch returned no outcome".to_string()))
    }

    /// Backend name for diagnostics.
    fn backend_name(&self) -> &'static str;
}

/// Drain every page of a query.
///
/// The token is checked before each page request; a cancelled drain returns
/// `StorageError::Cancelled` without issuing further requests.
pub async fn query_all(
    store: &dyn TableStore,
    table: &str,
    query: &TableQuery,
    cancel: &CancellationToken,
) -> Result<Vec<TableRow>> {
    let mut rows = Vec::new();
    let mut continuation: Option<ContinuationToken> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let page = store.query(table, query, continuation.as_ref()).await?;
        rows.extend(page.rows);
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(rows),
        }
    }
}
