//! # idtable-store
//!
//! Table-store abstraction used by the identity layer. The store offers only
//! what a partitioned table service offers:
//!
//! - point read by `(partition key, row key)` with column projection
//! - ordered range query inside one partition (or an OR of up to 50
//!   partitions) with continuation-token paging
//! - atomic batch write scoped to a single partition
//! - single-row conditional write/delete keyed by a match token (ETag)
//!
//! ## Architecture
//!
//! ```text
//! idtable-identity (keys, indexes, aggregates, fan-out)
//!     ↓
//! idtable-store (TableStore trait, BatchWriter)
//!     ↓
//! MemoryTableStore | RocksTableStore
//! ```

pub mod batch_writer;
pub mod error;
pub mod memory_impl;
pub mod operation;
pub mod query;
pub mod rocksdb_impl;
pub mod rocksdb_init;
pub mod row;
pub mod storage_trait;
pub mod test_utils;

pub use batch_writer::{BatchOutcome, BatchWriter, PartitionFailure};
pub use error::{BatchError, Result, StorageError};
pub use memory_impl::MemoryTableStore;
pub use operation::{OperationOutcome, TableOperation};
pub use query::{ContinuationToken, PartitionFilter, QueryPage, RowKeyFilter, TableQuery};
pub use rocksdb_impl::RocksTableStore;
pub use rocksdb_init::RocksDbInit;
pub use row::{ETag, MatchToken, Properties, Property, TableRow};
pub use storage_trait::{query_all, TableStore, MAX_BATCH_OPERATIONS};
