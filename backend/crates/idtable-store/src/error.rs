//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during table-store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Table (column family) does not exist
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Conditional write or delete targeted a row that does not exist
    #[error("Row not found: {partition_key}/{row_key}")]
    NotFound {
        partition_key: String,
        row_key: String,
    },

    /// Insert of a row that already exists
    #[error("Row already exists: {partition_key}/{row_key}")]
    Conflict {
        partition_key: String,
        row_key: String,
    },

    /// Match token no longer matches the stored row
    #[error("Precondition failed (stale ETag) for {partition_key}/{row_key}")]
    PreconditionFailed {
        partition_key: String,
        row_key: String,
    },

    /// Batch violates the store's batch rules (size, single partition, duplicates)
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Query violates the store's filter rules
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Key contains characters the store does not accept
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// I/O error from the underlying storage
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation stopped by a cancellation signal before reaching the store
    #[error("Operation cancelled")]
    Cancelled,

    /// Failure injected by a test fault plan
    #[error("Injected fault: {0}")]
    Injected(String),

    #[error("Storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// True when the row targeted by the operation was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// True for optimistic-concurrency failures (stale ETag or duplicate insert).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict { .. } | StorageError::PreconditionFailed { .. }
        )
    }

    pub(crate) fn not_found(partition_key: &str, row_key: &str) -> Self {
        StorageError::NotFound {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
        }
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Aggregated failure of a multi-partition write.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchError {
    /// Some partitions failed; the others were applied
    #[error("{} of {} partition(s) failed: {}", failures.len(), attempted, describe(failures))]
    Partial {
        attempted: usize,
        failures: Vec<(String, StorageError)>,
    },

    /// Cancellation stopped dispatch; undispatched partitions stay queued
    #[error("Batch submission cancelled with {pending_partitions} partition(s) not dispatched")]
    Cancelled { pending_partitions: usize },
}

fn describe(failures: &[(String, StorageError)]) -> String {
    failures
        .iter()
        .map(|(pk, err)| format!("{}: {}", pk, err))
        .collect::<Vec<_>>()
        .join("; ")
}
