//! Write operations and their shared semantics.
//!
//! Backends differ in how they persist rows, but they must agree on what an
//! operation does to an existing (or missing) row. That agreement lives in
//! [`apply`].

use crate::error::{Result, StorageError};
use crate::row::{ETag, MatchToken, StoredRow, TableRow};

/// A single-row write.
#[derive(Debug, Clone, PartialEq)]
pub enum TableOperation {
    /// Fails with `Conflict` when the row exists
    Insert(TableRow),
    /// Replaces all properties; fails when missing or the token is stale
    Replace {
        row: TableRow,
        match_token: MatchToken,
    },
    /// Overwrites the given properties, keeps the others
    Merge {
        row: TableRow,
        match_token: MatchToken,
    },
    InsertOrReplace(TableRow),
    InsertOrMerge(TableRow),
    Delete {
        partition_key: String,
        row_key: String,
        match_token: MatchToken,
    },
}

impl TableOperation {
    /// Unconditional delete.
    pub fn delete(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        TableOperation::Delete {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            match_token: MatchToken::Any,
        }
    }

    pub fn replace(row: TableRow, match_token: MatchToken) -> Self {
        TableOperation::Replace { row, match_token }
    }

    pub fn partition_key(&self) -> &str {
        match self {
            TableOperation::Insert(row)
            | TableOperation::InsertOrReplace(row)
            | TableOperation::InsertOrMerge(row)
            | TableOperation::Replace { row, .. }
            | TableOperation::Merge { row, .. } => &row.partition_key,
            TableOperation::Delete { partition_key, .. } => partition_key,
        }
    }

    pub fn row_key(&self) -> &str {
        match self {
            TableOperation::Insert(row)
            | TableOperation::InsertOrReplace(row)
            | TableOperation::InsertOrMerge(row)
            | TableOperation::Replace { row, .. }
            | TableOperation::Merge { row, .. } => &row.row_key,
            TableOperation::Delete { row_key, .. } => row_key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TableOperation::Insert(_) => "insert",
            TableOperation::Replace { .. } => "replace",
            TableOperation::Merge { .. } => "merge",
            TableOperation::InsertOrReplace(_) => "insert_or_replace",
            TableOperation::InsertOrMerge(_) => "insert_or_merge",
            TableOperation::Delete { .. } => "delete",
        }
    }
}

/// Result of one applied operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub partition_key: String,
    pub row_key: String,
    /// New ETag of the written row; `None` for deletes
    pub etag: Option<ETag>,
}

/// Compute the new state of a row.
///
/// `existing` is the currently stored row (if any). Returns the row to store,
/// or `None` when the row must be removed.
pub(crate) fn apply(existing: Option<&StoredRow>, op: &TableOperation) -> Result<Option<StoredRow>> {
    let pk = op.partition_key();
    let rk = op.row_key();
    let check = |token: &MatchToken| -> Result<&StoredRow> {
        let current = existing.ok_or_else(|| StorageError::not_found(pk, rk))?;
        if token.matches(&current.etag) {
            Ok(current)
        } else {
            Err(StorageError::PreconditionFailed {
                partition_key: pk.to_string(),
                row_key: rk.to_string(),
            })
        }
    };

    match op {
        TableOperation::Insert(row) => {
            if existing.is_some() {
                return Err(StorageError::Conflict {
                    partition_key: pk.to_string(),
                    row_key: rk.to_string(),
                });
            }
            Ok(Some(StoredRow::new(row.properties.clone())))
        }
        TableOperation::Replace { row, match_token } => {
            check(match_token)?;
            Ok(Some(StoredRow::new(row.properties.clone())))
        }
        TableOperation::Merge { row, match_token } => {
            let current = check(match_token)?;
            let mut merged = current.properties.clone();
            merged.extend(row.properties.clone());
            Ok(Some(StoredRow::new(merged)))
        }
        TableOperation::InsertOrReplace(row) => Ok(Some(StoredRow::new(row.properties.clone()))),
        TableOperation::InsertOrMerge(row) => {
            let mut merged = existing.map(|c| c.properties.clone()).unwrap_or_default();
            merged.extend(row.properties.clone());
            Ok(Some(StoredRow::new(merged)))
        }
        TableOperation::Delete { match_token, .. } => {
            check(match_token)?;
            Ok(None)
        }
    }
}

/// Validate keys of an operation.
pub(crate) fn validate(op: &TableOperation) -> Result<()> {
    crate::row::validate_key(op.partition_key())?;
    crate::row::validate_key(op.row_key())
}

/// Validate the single-partition batch rules.
pub(crate) fn validate_batch(operations: &[TableOperation]) -> Result<()> {
    if operations.is_empty() {
        return Err(StorageError::InvalidBatch("batch is empty".to_string()));
    }
    if operations.len() > crate::storage_trait::MAX_BATCH_OPERATIONS {
        return Err(StorageError::InvalidBatch(format!(
            "batch has {} operations (max {})",
            operations.len(),
            crate::storage_trait::MAX_BATCH_OPERATIONS
        )));
    }
    let pk = operations[0].partition_key();
    let mut seen = std::collections::HashSet::with_capacity(operations.len());
    for op in operations {
        validate(op)?;
        if op.partition_key() != pk {
            return Err(StorageError::InvalidBatch(format!(
                "batch spans partitions '{}' and '{}'",
                pk,
                op.partition_key()
            )));
        }
        if !seen.insert(op.row_key()) {
            return Err(StorageError::InvalidBatch(format!(
                "row '{}' appears twice in one batch",
                op.row_key()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Properties;

    fn stored(name: &str) -> StoredRow {
        let mut props = Properties::new();
        props.insert("Name".into(), name.into());
        props.insert("Keep".into(), true.into());
        StoredRow::new(props)
    }

    #[test]
    fn test_insert_conflicts_on_existing() {
        let current = stored("a");
        let op = TableOperation::Insert(TableRow::new("p", "r"));
        assert!(apply(Some(&current), &op).unwrap_err().is_conflict());
        assert!(apply(None, &op).unwrap().is_some());
    }

    #[test]
    fn test_replace_requires_matching_etag() {
        let current = stored("a");
        let row = TableRow::new("p", "r").with("Name", "b");

        let stale = TableOperation::replace(row.clone(), MatchToken::ETag(ETag::new("old")));
        assert!(matches!(
            apply(Some(&current), &stale),
            Err(StorageError::PreconditionFailed { .. })
        ));

        let fresh = TableOperation::replace(row, MatchToken::ETag(current.etag.clone()));
        let next = apply(Some(&current), &fresh).unwrap().unwrap();
        assert_eq!(next.properties.get("Name"), Some(&"b".into()));
        assert!(next.properties.get("Keep").is_none());
        assert_ne!(next.etag, current.etag);
    }

    #[test]
    fn test_merge_keeps_unlisted_properties() {
        let current = stored("a");
        let op = TableOperation::Merge {
            row: TableRow::new("p", "r").with("Name", "b"),
            match_token: MatchToken::Any,
        };
        let next = apply(Some(&current), &op).unwrap().unwrap();
        assert_eq!(next.properties.get("Keep"), Some(&true.into()));
        assert_eq!(next.properties.get("Name"), Some(&"b".into()));
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let op = TableOperation::delete("p", "r");
        assert!(apply(None, &op).unwrap_err().is_not_found());
        assert!(apply(Some(&stored("a")), &op).unwrap().is_none());
    }

    #[test]
    fn test_validate_batch_rules() {
        let a = TableOperation::InsertOrReplace(TableRow::new("p1", "a"));
        let b = TableOperation::InsertOrReplace(TableRow::new("p2", "b"));
        assert!(validate_batch(&[a.clone(), b]).is_err());
        assert!(validate_batch(&[a.clone(), a.clone()]).is_err());
        assert!(validate_batch(&[]).is_err());
        assert!(validate_batch(&[a]).is_ok());
    }
}
