//! Query model: partition filter, row-key filter, projection, paging.
//!
//! The store only understands equality on the partition key (or an OR of a
//! bounded number of partition keys) combined with equality or a half-open
//! range on the row key. Nothing else is pushed down.

use std::collections::BTreeSet;

use crate::error::{Result, StorageError};

/// Which partitions a query reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionFilter {
    /// `PartitionKey eq 'pk'`
    Single(String),
    /// `PartitionKey eq 'a' or PartitionKey eq 'b' ...`, sorted and deduplicated
    AnyOf(Vec<String>),
}

/// Which rows of a partition a query reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RowKeyFilter {
    #[default]
    All,
    /// `RowKey eq 'rk'`
    Equal(String),
    /// `RowKey ge 'lower' and RowKey lt 'upper'`
    Range { lower: String, upper: String },
}

impl RowKeyFilter {
    pub fn matches(&self, row_key: &str) -> bool {
        match self {
            RowKeyFilter::All => true,
            RowKeyFilter::Equal(rk) => rk == row_key,
            RowKeyFilter::Range { lower, upper } => {
                row_key >= lower.as_str() && row_key < upper.as_str()
            }
        }
    }

    /// First row key that can match, for seeking.
    pub fn lower_bound(&self) -> &str {
        match self {
            RowKeyFilter::All => "",
            RowKeyFilter::Equal(rk) => rk,
            RowKeyFilter::Range { lower, .. } => lower,
        }
    }

    /// True once `row_key` sorts after every key the filter can match.
    pub fn is_exhausted_at(&self, row_key: &str) -> bool {
        match self {
            RowKeyFilter::All => false,
            RowKeyFilter::Equal(rk) => row_key > rk.as_str(),
            RowKeyFilter::Range { upper, .. } => row_key >= upper.as_str(),
        }
    }
}

/// A query against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableQuery {
    pub partition: PartitionFilter,
    pub row_keys: RowKeyFilter,
    /// Column projection; `None` returns every property
    pub select: Option<Vec<String>>,
    /// Maximum rows per page
    pub take: Option<usize>,
}

impl TableQuery {
    /// Store limit on partition-key clauses in one filter.
    pub const MAX_PARTITION_CLAUSES: usize = 50;

    /// Query every row of one partition.
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition: PartitionFilter::Single(partition_key.into()),
            row_keys: RowKeyFilter::All,
            select: None,
            take: None,
        }
    }

    /// Query several partitions with one OR filter.
    ///
    /// Fails with `InvalidQuery` when no key or more than
    /// [`Self::MAX_PARTITION_CLAUSES`] distinct keys are given.
    pub fn partitions<I, S>(partition_keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: BTreeSet<String> = partition_keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(StorageError::InvalidQuery(
                "partition OR filter needs at least one key".to_string(),
            ));
        }
        if keys.len() > Self::MAX_PARTITION_CLAUSES {
            return Err(StorageError::InvalidQuery(format!(
                "partition OR filter has {} clauses (max {})",
                keys.len(),
                Self::MAX_PARTITION_CLAUSES
            )));
        }
        let partition = if keys.len() == 1 {
            PartitionFilter::Single(keys.into_iter().next().unwrap_or_default())
        } else {
            PartitionFilter::AnyOf(keys.into_iter().collect())
        };
        Ok(Self {
            partition,
            row_keys: RowKeyFilter::All,
            select: None,
            take: None,
        })
    }

    pub fn row_key(mut self, row_key: impl Into<String>) -> Self {
        self.row_keys = RowKeyFilter::Equal(row_key.into());
        self
    }

    /// Restrict to `lower <= RowKey < upper`.
    pub fn row_key_range(mut self, lower: impl Into<String>, upper: impl Into<String>) -> Self {
        self.row_keys = RowKeyFilter::Range {
            lower: lower.into(),
            upper: upper.into(),
        };
        self
    }

    pub fn select<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.select = Some(columns.iter().map(|c| c.as_ref().to_string()).collect());
        self
    }

    pub fn take(mut self, rows: usize) -> Self {
        self.take = Some(rows);
        self
    }

    /// Partition keys covered, in ascending order.
    pub fn partition_keys(&self) -> Vec<&str> {
        match &self.partition {
            PartitionFilter::Single(pk) => vec![pk.as_str()],
            PartitionFilter::AnyOf(pks) => pks.iter().map(String::as_str).collect(),
        }
    }

    pub fn matches(&self, partition_key: &str, row_key: &str) -> bool {
        let partition_ok = match &self.partition {
            PartitionFilter::Single(pk) => pk == partition_key,
            PartitionFilter::AnyOf(pks) => pks.binary_search_by(|p| p.as_str().cmp(partition_key)).is_ok(),
        };
        partition_ok && self.row_keys.matches(row_key)
    }

    /// True when no row at or after `(partition_key, row_key)` can match.
    /// Scans walk keys in ascending order, so they stop here.
    pub fn is_past_end(&self, partition_key: &str, row_key: &str) -> bool {
        let last = match &self.partition {
            PartitionFilter::Single(pk) => pk.as_str(),
            PartitionFilter::AnyOf(pks) => match pks.last() {
                Some(pk) => pk.as_str(),
                None => return true,
            },
        };
        match partition_key.cmp(last) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.row_keys.is_exhausted_at(row_key),
            std::cmp::Ordering::Less => false,
        }
    }

    /// Filter rendered in the table service's expression syntax, for logs.
    pub fn filter_expression(&self) -> String {
        let partition = match &self.partition {
            PartitionFilter::Single(pk) => format!("PartitionKey eq '{}'", pk),
            PartitionFilter::AnyOf(pks) => pks
                .iter()
                .map(|pk| format!("PartitionKey eq '{}'", pk))
                .collect::<Vec<_>>()
                .join(" or "),
        };
        match &self.row_keys {
            RowKeyFilter::All => partition,
            RowKeyFilter::Equal(rk) => format!("({}) and (RowKey eq '{}')", partition, rk),
            RowKeyFilter::Range { lower, upper } => format!(
                "({}) and (RowKey ge '{}' and RowKey lt '{}')",
                partition, lower, upper
            ),
        }
    }
}

/// Position at which the next page starts (inclusive).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContinuationToken {
    pub next_partition_key: String,
    pub next_row_key: String,
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub rows: Vec<crate::row::TableRow>,
    /// `Some` when more rows may follow
    pub continuation: Option<ContinuationToken>,
}
