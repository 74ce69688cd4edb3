use idtable_store::TableRow;

use super::columns::{ID, KEY_VERSION, PRIMARY_KEY};
use super::{key_version_of, required_str};
use crate::error::Result;
use crate::key_helper::KeyVersion;

/// One alternate-key → primary-key mapping in the index table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexEntry {
    /// Derived key of the alternate identifier
    pub partition_key: String,
    /// Owner's primary key, or the derived key itself for exact-lookup kinds
    pub row_key: String,
    /// Owner's stable id
    pub id: String,
    /// Owner's aggregate partition key
    pub primary_key: String,
    pub key_version: KeyVersion,
}

impl IndexEntry {
    /// Columns fetched by index scans.
    pub const PROJECTION: [&'static str; 3] = [ID, PRIMARY_KEY, KEY_VERSION];

    pub fn to_row(&self) -> TableRow {
        TableRow::new(self.partition_key.as_str(), self.row_key.as_str())
            .with(ID, self.id.as_str())
            .with(PRIMARY_KEY, self.primary_key.as_str())
            .with(KEY_VERSION, self.key_version.as_i32())
    }

    pub fn from_row(row: &TableRow) -> Result<Self> {
        Ok(Self {
            partition_key: row.partition_key.clone(),
            row_key: row.row_key.clone(),
            id: required_str(row, ID)?,
            // Rows written before PrimaryKey existed point at their row key
            primary_key: row
                .get_str(PRIMARY_KEY)
                .map(str::to_string)
                .unwrap_or_else(|| row.row_key.clone()),
            key_version: key_version_of(row),
        })
    }

    /// Identity of the row in the index table.
    pub fn address(&self) -> (&str, &str) {
        (&self.partition_key, &self.row_key)
    }
}
