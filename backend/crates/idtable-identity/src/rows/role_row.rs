use idtable_commons::{Role, RoleId};
use idtable_store::TableRow;

use super::columns::*;
use super::{optional_str, required_str, RowMapping};
use crate::error::Result;

/// Entity row of a role aggregate.
pub struct RoleRow;

impl RowMapping for Role {
    fn write_columns(&self, row: &mut TableRow) {
        row.set(ID, self.id.as_str());
        row.set(NAME, self.name.as_str());
        row.set(NORMALIZED_NAME, self.normalized_name.as_str());
        row.set_opt(CONCURRENCY_STAMP, self.concurrency_stamp.as_deref());
    }

    fn read_columns(row: &TableRow) -> Result<Self> {
        Ok(Role {
            id: RoleId::new(required_str(row, ID)?),
            name: required_str(row, NAME)?,
            normalized_name: required_str(row, NORMALIZED_NAME)?,
            concurrency_stamp: optional_str(row, CONCURRENCY_STAMP),
            etag: row.etag.as_ref().map(|e| e.as_str().to_string()),
        })
    }
}

impl RoleRow {
    pub fn is_entity_row(row: &TableRow) -> bool {
        row.partition_key == row.row_key
    }
}
