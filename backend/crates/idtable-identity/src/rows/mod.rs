//! Explicit row mappings.
//!
//! Every persisted type has a hand-written mapping to and from the flat
//! property map of a table row. Column names below are part of the on-disk
//! contract.

mod dependent_rows;
mod index_row;
mod role_row;
mod user_row;

pub use dependent_rows::{ClaimRow, LoginRow, RoleMembershipRow, TokenRow};
pub use index_row::IndexEntry;
pub use role_row::RoleRow;
pub use user_row::UserRow;

use idtable_store::TableRow;

use crate::error::{IdentityStoreError, Result};
use crate::key_helper::KeyVersion;

/// Column names.
pub mod columns {
    pub const ID: &str = "Id";
    pub const USER_ID: &str = "UserId";
    pub const ROLE_ID: &str = "RoleId";
    pub const USER_NAME: &str = "UserName";
    pub const NORMALIZED_USER_NAME: &str = "NormalizedUserName";
    pub const EMAIL: &str = "Email";
    pub const NORMALIZED_EMAIL: &str = "NormalizedEmail";
    pub const EMAIL_CONFIRMED: &str = "EmailConfirmed";
    pub const PASSWORD_HASH: &str = "PasswordHash";
    pub const SECURITY_STAMP: &str = "SecurityStamp";
    pub const CONCURRENCY_STAMP: &str = "ConcurrencyStamp";
    pub const PHONE_NUMBER: &str = "PhoneNumber";
    pub const PHONE_NUMBER_CONFIRMED: &str = "PhoneNumberConfirmed";
    pub const TWO_FACTOR_ENABLED: &str = "TwoFactorEnabled";
    pub const LOCKOUT_END: &str = "LockoutEnd";
    pub const LOCKOUT_ENABLED: &str = "LockoutEnabled";
    pub const ACCESS_FAILED_COUNT: &str = "AccessFailedCount";
    pub const CREATED_AT: &str = "CreatedAt";
    pub const UPDATED_AT: &str = "UpdatedAt";
    pub const CLAIM_TYPE: &str = "ClaimType";
    pub const CLAIM_VALUE: &str = "ClaimValue";
    pub const LOGIN_PROVIDER: &str = "LoginProvider";
    pub const PROVIDER_KEY: &str = "ProviderKey";
    pub const PROVIDER_DISPLAY_NAME: &str = "ProviderDisplayName";
    pub const ROLE_NAME: &str = "RoleName";
    pub const NAME: &str = "Name";
    pub const NORMALIZED_NAME: &str = "NormalizedName";
    pub const VALUE: &str = "Value";
    pub const PRIMARY_KEY: &str = "PrimaryKey";
    pub const KEY_VERSION: &str = "KeyVersion";
}

/// Maps a type to and from a table row.
pub trait RowMapping: Sized {
    /// Writes this value's columns into `row`, keys excluded.
    fn write_columns(&self, row: &mut TableRow);

    fn read_columns(row: &TableRow) -> Result<Self>;

    /// Build a complete row stamped with `version`.
    fn to_row(&self, partition_key: &str, row_key: &str, version: KeyVersion) -> TableRow {
        let mut row = TableRow::new(partition_key, row_key);
        self.write_columns(&mut row);
        row.set(columns::KEY_VERSION, version.as_i32());
        row
    }
}

/// Key version stamped on a row; rows written before versioning count as legacy.
pub fn key_version_of(row: &TableRow) -> KeyVersion {
    row.get_i32(columns::KEY_VERSION)
        .and_then(KeyVersion::from_i32)
        .unwrap_or(KeyVersion::Legacy)
}

pub(crate) fn required_str(row: &TableRow, column: &str) -> Result<String> {
    row.get_str(column).map(str::to_string).ok_or_else(|| {
        IdentityStoreError::Mapping(format!(
            "row {}/{} is missing column '{}'",
            row.partition_key, row.row_key, column
        ))
    })
}

pub(crate) fn optional_str(row: &TableRow, column: &str) -> Option<String> {
    row.get_str(column).map(str::to_string)
}
