//! In-memory table store.
//!
//! Keeps every table in a `BTreeMap` ordered by `(partition key, row key)`, so
//! paging and range scans behave exactly like the disk backend. Used by tests
//! and by `storage.backend = "memory"`.
//!
//! Besides the store itself this backend carries test instrumentation:
//! request counters, an optional per-request latency with an in-flight gauge,
//! and fault injection for simulating failures between write steps.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StorageError};
use crate::operation::{self, OperationOutcome, TableOperation};
use crate::query::{ContinuationToken, QueryPage, TableQuery};
use crate::row::{StoredRow, TableRow};
use crate::storage_trait::TableStore;

type TableData = BTreeMap<(String, String), StoredRow>;

/// Decides whether a batch should fail: `(table, operations) -> fail?`
type FaultRule = Box<dyn Fn(&str, &[TableOperation]) -> bool + Send + Sync>;

/// Request counters.
#[derive(Debug, Default)]
struct StoreStats {
    gets: AtomicUsize,
    queries: AtomicUsize,
    batches: AtomicUsize,
    operations: AtomicUsize,
    scanned: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight gauge on drop.
struct InFlightGuard<'a>(&'a StoreStats);

impl<'a> InFlightGuard<'a> {
    fn enter(stats: &'a StoreStats) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`TableStore`].
pub struct MemoryTableStore {
    tables: RwLock<HashMap<String, TableData>>,
    max_page_size: usize,
    latency: Option<Duration>,
    faults: Mutex<Vec<FaultRule>>,
    stats: StoreStats,
}

impl Default for MemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTableStore {
    pub const DEFAULT_MAX_PAGE_SIZE: usize = 1000;

    pub fn new() -> Self {
        Self::with_max_page_size(Self::DEFAULT_MAX_PAGE_SIZE)
    }

    /// Create a store whose query pages never exceed `max_page_size` rows.
    pub fn with_max_page_size(max_page_size: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            max_page_size: max_page_size.max(1),
            latency: None,
            faults: Mutex::new(Vec::new()),
            stats: StoreStats::default(),
        }
    }

    /// Delay every request by `latency`; makes concurrency observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Fail every batch that matches `rule`.
    pub fn inject_fault<F>(&self, rule: F)
    where
        F: Fn(&str, &[TableOperation]) -> bool + Send + Sync + 'static,
    {
        self.faults.lock().push(Box::new(rule));
    }

    /// Fail every batch written to `partition_key` of `table`.
    pub fn fail_partition(&self, table: &str, partition_key: &str) {
        let table = table.to_string();
        let partition_key = partition_key.to_string();
        self.inject_fault(move |t, ops| {
            t == table && ops.first().map(|op| op.partition_key()) == Some(partition_key.as_str())
        });
    }

    /// Fail every batch containing a delete on `table`.
    pub fn fail_deletes(&self, table: &str) {
        let table = table.to_string();
        self.inject_fault(move |t, ops| {
            t == table && ops.iter().any(|op| matches!(op, TableOperation::Delete { .. }))
        });
    }

    /// Let `n` more batches through, then fail all of them.
    pub fn fail_writes_after(&self, n: usize) {
        let remaining = AtomicUsize::new(n);
        self.inject_fault(move |_, _| {
            remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
                .is_err()
        });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    pub fn get_count(&self) -> usize {
        self.stats.gets.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.stats.queries.load(Ordering::SeqCst)
    }

    pub fn batch_count(&self) -> usize {
        self.stats.batches.load(Ordering::SeqCst)
    }

    /// Operations applied by successful batches.
    pub fn operation_count(&self) -> usize {
        self.stats.operations.load(Ordering::SeqCst)
    }

    /// Rows visited by query scans, matching or not.
    pub fn scanned_count(&self) -> usize {
        self.stats.scanned.load(Ordering::SeqCst)
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.stats.gets,
            &self.stats.queries,
            &self.stats.batches,
            &self.stats.operations,
            &self.stats.scanned,
            &self.stats.max_in_flight,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Every row of `table`, in key order.
    pub fn dump(&self, table: &str) -> Vec<TableRow> {
        self.tables
            .read()
            .get(table)
            .map(|data| {
                data.iter()
                    .map(|((pk, rk), stored)| stored.to_row(pk, rk))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Rows of one partition, in row-key order.
    pub fn partition_rows(&self, table: &str, partition_key: &str) -> Vec<TableRow> {
        self.dump(table)
            .into_iter()
            .filter(|row| row.partition_key == partition_key)
            .collect()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_faults(&self, table: &str, operations: &[TableOperation]) -> Result<()> {
        let faults = self.faults.lock();
        if faults.iter().any(|rule| rule(table, operations)) {
            let pk = operations.first().map(|op| op.partition_key()).unwrap_or("");
            log::debug!("Injected fault on {}/{}", table, pk);
            return Err(StorageError::Injected(format!(
                "batch on {}/{} rejected",
                table, pk
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        self.tables.write().entry(table.to_string()).or_default();
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.read().contains_key(table))
    }

    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        select: Option<&[String]>,
    ) -> Result<Option<TableRow>> {
        let _guard = InFlightGuard::enter(&self.stats);
        self.stats.gets.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;
        Ok(data
            .get(&(partition_key.to_string(), row_key.to_string()))
            .map(|stored| stored.to_row(partition_key, row_key).project(select)))
    }

    async fn query(
        &self,
        table: &str,
        query: &TableQuery,
        continuation: Option<&ContinuationToken>,
    ) -> Result<QueryPage> {
        let _guard = InFlightGuard::enter(&self.stats);
        self.stats.queries.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let limit = query
            .take
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);
        let first_pk = match query.partition_keys().first() {
            Some(pk) => pk.to_string(),
            None => return Ok(QueryPage::default()),
        };
        let start = match continuation {
            Some(token) => (token.next_partition_key.clone(), token.next_row_key.clone()),
            None => (first_pk, query.row_keys.lower_bound().to_string()),
        };

        let tables = self.tables.read();
        let data = tables
            .get(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;

        let mut page = QueryPage::default();
        for ((pk, rk), stored) in data.range(start..) {
            if query.is_past_end(pk, rk) {
                break;
            }
            self.stats.scanned.fetch_add(1, Ordering::SeqCst);
            if !query.matches(pk, rk) {
                continue;
            }
            if page.rows.len() == limit {
                page.continuation = Some(ContinuationToken {
                    next_partition_key: pk.clone(),
                    next_row_key: rk.clone(),
                });
                break;
            }
            page.rows.push(stored.to_row(pk, rk).project(query.select.as_deref()));
        }
        Ok(page)
    }

    async fn submit_batch(
        &self,
        table: &str,
        operations: Vec<TableOperation>,
    ) -> Result<Vec<OperationOutcome>> {
        operation::validate_batch(&operations)?;
        let _guard = InFlightGuard::enter(&self.stats);
        self.stats.batches.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_faults(table, &operations)?;

        let mut tables = self.tables.write();
        let data = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))?;

        // Rows are distinct, so each op can be evaluated against current state
        // before anything is written.
        let mut staged = Vec::with_capacity(operations.len());
        for op in &operations {
            let key = (op.partition_key().to_string(), op.row_key().to_string());
            let next = operation::apply(data.get(&key), op)?;
            staged.push((key, next));
        }

        let mut outcomes = Vec::with_capacity(staged.len());
        for ((pk, rk), next) in staged {
            let etag = match next {
                Some(stored) => {
                    let etag = stored.etag.clone();
                    data.insert((pk.clone(), rk.clone()), stored);
                    Some(etag)
                }
                None => {
                    data.remove(&(pk.clone(), rk.clone()));
                    None
                }
            };
            outcomes.push(OperationOutcome {
                partition_key: pk,
                row_key: rk,
                etag,
            });
        }
        self.stats
            .operations
            .fetch_add(outcomes.len(), Ordering::SeqCst);
        Ok(outcomes)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::MatchToken;
    use crate::storage_trait::query_all;
    use tokio_util::sync::CancellationToken;

    async fn store_with_rows(max_page: usize) -> MemoryTableStore {
        let store = MemoryTableStore::with_max_page_size(max_page);
        store.create_table_if_not_exists("t").await.unwrap();
        for pk in ["a", "b", "c"] {
            let ops = (0..5)
                .map(|i| TableOperation::InsertOrReplace(TableRow::new(pk, format!("r{}", i)).with("I", i)))
                .collect();
            store.submit_batch("t", ops).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_get_and_missing_table() {
        let store = store_with_rows(10).await;
        let row = store.get("t", "a", "r1", None).await.unwrap().unwrap();
        assert_eq!(row.get_i32("I"), Some(1));
        assert!(row.etag.is_some());
        assert!(store.get("t", "a", "zz", None).await.unwrap().is_none());
        assert!(matches!(
            store.get("nope", "a", "r1", None).await,
            Err(StorageError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_query_pages_with_continuation() {
        let store = store_with_rows(2).await;
        let query = TableQuery::partition("b");

        let first = store.query("t", &query, None).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(first.continuation.is_some());

        let all = query_all(&store, "t", &query, &CancellationToken::new())
            .await
            .unwrap();
        let keys: Vec<_> = all.iter().map(|r| r.row_key.as_str()).collect();
        assert_eq!(keys, vec!["r0", "r1", "r2", "r3", "r4"]);
        assert!(all.iter().all(|r| r.partition_key == "b"));
    }

    #[tokio::test]
    async fn test_query_or_filter_and_range() {
        let store = store_with_rows(100).await;
        let query = TableQuery::partitions(vec!["c", "a"])
            .unwrap()
            .row_key_range("r1", "r3");
        let page = store.query("t", &query, None).await.unwrap();
        let keys: Vec<_> = page
            .rows
            .iter()
            .map(|r| format!("{}/{}", r.partition_key, r.row_key))
            .collect();
        assert_eq!(keys, vec!["a/r1", "a/r2", "c/r1", "c/r2"]);
        assert!(page.continuation.is_none());
    }

    #[tokio::test]
    async fn test_range_scan_stops_at_upper_bound() {
        let store = MemoryTableStore::new();
        store.create_table_if_not_exists("t").await.unwrap();
        let ops = ["C_1", "C_2", "L_1", "L_2", "L_3", "R_1", "R_2", "R_3", "R_4"]
            .iter()
            .map(|rk| TableOperation::InsertOrReplace(TableRow::new("N_1", *rk)))
            .collect();
        store.submit_batch("t", ops).await.unwrap();

        let query = TableQuery::partition("N_1").row_key_range("C_", "D_");
        let page = store.query("t", &query, None).await.unwrap();
        let keys: Vec<_> = page.rows.iter().map(|r| r.row_key.as_str()).collect();
        assert_eq!(keys, vec!["C_1", "C_2"]);
        assert!(page.continuation.is_none());
        assert_eq!(store.scanned_count(), 2);
    }

    #[tokio::test]
    async fn test_query_projection() {
        let store = store_with_rows(100).await;
        store
            .execute("t", TableOperation::InsertOrMerge(TableRow::new("a", "r0").with("Extra", "x")))
            .await
            .unwrap();
        let query = TableQuery::partition("a").row_key("r0").select(&["Extra"]);
        let page = store.query("t", &query, None).await.unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].properties.len(), 1);
        assert_eq!(page.rows[0].get_str("Extra"), Some("x"));
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let store = store_with_rows(100).await;
        let ops = vec![
            TableOperation::InsertOrReplace(TableRow::new("a", "new")),
            TableOperation::Insert(TableRow::new("a", "r0")),
        ];
        let err = store.submit_batch("t", ops).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(store.get("t", "a", "new", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let store = store_with_rows(100).await;
        let row = store.get("t", "a", "r0", None).await.unwrap().unwrap();
        let stale = TableOperation::Delete {
            partition_key: "a".into(),
            row_key: "r0".into(),
            match_token: MatchToken::ETag(crate::row::ETag::new("stale")),
        };
        assert!(store.execute("t", stale).await.is_err());
        let fresh = TableOperation::Delete {
            partition_key: "a".into(),
            row_key: "r0".into(),
            match_token: MatchToken::ETag(row.etag.unwrap()),
        };
        store.execute("t", fresh).await.unwrap();
        assert!(store.get("t", "a", "r0", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = store_with_rows(100).await;
        store.fail_partition("t", "b");
        let err = store
            .execute("t", TableOperation::InsertOrReplace(TableRow::new("b", "x")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Injected(_)));
        store
            .execute("t", TableOperation::InsertOrReplace(TableRow::new("a", "x")))
            .await
            .unwrap();

        store.clear_faults();
        store.fail_writes_after(1);
        assert!(store.execute("t", TableOperation::delete("a", "x")).await.is_ok());
        assert!(store.execute("t", TableOperation::delete("a", "r0")).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_query_all() {
        let store = store_with_rows(100).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = query_all(&store, "t", &TableQuery::partition("a"), &cancel).await;
        assert_eq!(result.unwrap_err(), StorageError::Cancelled);
        assert_eq!(store.query_count(), 0);
    }
}
