//! Partition-grouping batch writer.
//!
//! The store applies a batch atomically only when every operation targets the
//! same partition, and caps a batch at [`MAX_BATCH_OPERATIONS`]. `BatchWriter`
//! buffers operations, groups them by partition key, and on submit issues one
//! transaction per partition (chunked when needed), with a bounded number of
//! partitions in flight.
//!
//! A failing partition does not affect the others: their results are still
//! returned, and the failed operations stay buffered so a later `submit`
//! retries exactly what did not land.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use idtable_configs::BatchSettings;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{BatchError, StorageError};
use crate::operation::{OperationOutcome, TableOperation};
use crate::row::{MatchToken, TableRow};
use crate::storage_trait::{TableStore, MAX_BATCH_OPERATIONS};

/// Operations of one partition that did not land.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFailure {
    pub partition_key: String,
    pub error: StorageError,
    /// Operations not applied (the failed chunk and everything after it)
    pub operations: Vec<TableOperation>,
}

/// Union of per-partition results.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<OperationOutcome>,
    pub failures: Vec<PartitionFailure>,
    /// Partitions left undispatched because of cancellation
    pub cancelled_partitions: Vec<String>,
    pub attempted_partitions: usize,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cancelled_partitions.is_empty()
    }

    pub fn failed_partitions(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|f| f.partition_key.as_str())
            .collect()
    }

    /// Convert into the applied results, or a partial-failure error.
    pub fn into_result(self) -> Result<Vec<OperationOutcome>, BatchError> {
        if !self.failures.is_empty() {
            return Err(BatchError::Partial {
                attempted: self.attempted_partitions,
                failures: self
                    .failures
                    .into_iter()
                    .map(|f| (f.partition_key, f.error))
                    .collect(),
            });
        }
        if !self.cancelled_partitions.is_empty() {
            return Err(BatchError::Cancelled {
                pending_partitions: self.cancelled_partitions.len(),
            });
        }
        Ok(self.results)
    }
}

/// Buffers writes for one table and submits them per partition.
pub struct BatchWriter {
    store: Arc<dyn TableStore>,
    table: String,
    max_batch_size: usize,
    max_concurrent_partitions: usize,
    pending: BTreeMap<String, Vec<TableOperation>>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn TableStore>, table: impl Into<String>) -> Self {
        Self::with_settings(store, table, &BatchSettings::default())
    }

    pub fn with_settings(
        store: Arc<dyn TableStore>,
        table: impl Into<String>,
        settings: &BatchSettings,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            max_batch_size: settings.max_batch_size.clamp(1, MAX_BATCH_OPERATIONS),
            max_concurrent_partitions: settings.max_concurrent_partitions.max(1),
            pending: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Queue an insert; fails at submit time if the row exists.
    pub fn add(&mut self, row: TableRow) {
        self.push(TableOperation::Insert(row));
    }

    /// Queue a conditional full replace.
    pub fn update(&mut self, row: TableRow, match_token: MatchToken) {
        self.push(TableOperation::Replace { row, match_token });
    }

    pub fn merge(&mut self, row: TableRow, match_token: MatchToken) {
        self.push(TableOperation::Merge { row, match_token });
    }

    /// Queue an insert-or-replace.
    pub fn upsert(&mut self, row: TableRow) {
        self.push(TableOperation::InsertOrReplace(row));
    }

    pub fn delete(
        &mut self,
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
        match_token: MatchToken,
    ) {
        self.push(TableOperation::Delete {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            match_token,
        });
    }

    pub fn push(&mut self, operation: TableOperation) {
        self.pending
            .entry(operation.partition_key().to_string())
            .or_default()
            .push(operation);
    }

    pub fn extend<I: IntoIterator<Item = TableOperation>>(&mut self, operations: I) {
        for op in operations {
            self.push(op);
        }
    }

    /// Number of buffered operations.
    pub fn len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn partition_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_partitions(&self) -> Vec<&str> {
        self.pending.keys().map(String::as_str).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Submit every buffered operation, one transaction per partition.
    ///
    /// Partitions that land are removed from the buffer. The cancellation
    /// token is checked before each partition is dispatched; partitions
    /// already in flight are allowed to finish.
    pub async fn submit(&mut self, cancel: &CancellationToken) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            attempted_partitions: self.pending.len(),
            ..Default::default()
        };
        if self.pending.is_empty() {
            return outcome;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_partitions));
        let mut join_set = JoinSet::new();
        let mut dispatched: BTreeSet<String> = BTreeSet::new();

        for (partition_key, operations) in &self.pending {
            if cancel.is_cancelled() {
                outcome.cancelled_partitions.push(partition_key.clone());
                continue;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    outcome.cancelled_partitions.push(partition_key.clone());
                    continue;
                }
            };
            // Re-check after waiting for a slot
            if cancel.is_cancelled() {
                outcome.cancelled_partitions.push(partition_key.clone());
                continue;
            }

            let store = Arc::clone(&self.store);
            let table = self.table.clone();
            let pk = partition_key.clone();
            let chunks = chunk_operations(operations.clone(), self.max_batch_size);
            dispatched.insert(pk.clone());
            join_set.spawn(async move {
                let _permit = permit;
                submit_partition(store, table, pk, chunks).await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    log::warn!("Batch task for table '{}' failed: {}", self.table, e);
                    continue;
                }
            };
            dispatched.remove(&report.partition_key);
            outcome.results.extend(report.applied);
            match report.failure {
                None => {
                    self.pending.remove(&report.partition_key);
                }
                Some((error, remaining)) => {
                    log::warn!(
                        "Batch for {}/{} failed ({} operation(s) not applied): {}",
                        self.table,
                        report.partition_key,
                        remaining.len(),
                        error
                    );
                    self.pending
                        .insert(report.partition_key.clone(), remaining.clone());
                    outcome.failures.push(PartitionFailure {
                        partition_key: report.partition_key,
                        error,
                        operations: remaining,
                    });
                }
            }
        }

        // Tasks that never reported keep their operations buffered
        for pk in dispatched {
            let operations = self.pending.get(&pk).cloned().unwrap_or_default();
            outcome.failures.push(PartitionFailure {
                partition_key: pk,
                error: StorageError::Other("batch task aborted".to_string()),
                operations,
            });
        }

        if !outcome.failures.is_empty() {
            log::warn!(
                "{} of {} partition(s) failed on table '{}'",
                outcome.failures.len(),
                outcome.attempted_partitions,
                self.table
            );
        }
        outcome
    }
}

struct PartitionReport {
    partition_key: String,
    applied: Vec<OperationOutcome>,
    failure: Option<(StorageError, Vec<TableOperation>)>,
}

async fn submit_partition(
    store: Arc<dyn TableStore>,
    table: String,
    partition_key: String,
    chunks: Vec<Vec<TableOperation>>,
) -> PartitionReport {
    let mut applied = Vec::new();
    let mut chunks = chunks.into_iter();
    while let Some(chunk) = chunks.next() {
        log::debug!(
            "Submitting {} operation(s) to {}/{}",
            chunk.len(),
            table,
            partition_key
        );
        match store.submit_batch(&table, chunk.clone()).await {
            Ok(outcomes) => applied.extend(outcomes),
            Err(error) => {
                let remaining = chunk.into_iter().chain(chunks.flatten()).collect();
                return PartitionReport {
                    partition_key,
                    applied,
                    failure: Some((error, remaining)),
                };
            }
        }
    }
    PartitionReport {
        partition_key,
        applied,
        failure: None,
    }
}

/// Split one partition's operations into store-sized batches.
///
/// Order is preserved. A row touched twice starts a new chunk, since one
/// batch may not reference the same row twice.
fn chunk_operations(operations: Vec<TableOperation>, max_batch_size: usize) -> Vec<Vec<TableOperation>> {
    let mut chunks = Vec::new();
    let mut current: Vec<TableOperation> = Vec::new();
    let mut row_keys: HashSet<String> = HashSet::new();
    for op in operations {
        if current.len() == max_batch_size || row_keys.contains(op.row_key()) {
            chunks.push(std::mem::take(&mut current));
            row_keys.clear();
        }
        row_keys.insert(op.row_key().to_string());
        current.push(op);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
