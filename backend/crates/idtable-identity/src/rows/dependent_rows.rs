//! Rows co-located with their owning user.
//!
//! Each dependent row carries the owner's stable id in `UserId`.

use idtable_commons::{Claim, UserLogin, UserToken};
use idtable_store::TableRow;

use super::columns::*;
use super::{optional_str, required_str, RowMapping};
use crate::error::Result;

/// Claim row: `ClaimType`, `ClaimValue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRow {
    pub owner_id: String,
    pub claim: Claim,
}

impl RowMapping for ClaimRow {
    fn write_columns(&self, row: &mut TableRow) {
        row.set(USER_ID, self.owner_id.as_str());
        row.set(CLAIM_TYPE, self.claim.claim_type.as_str());
        row.set(CLAIM_VALUE, self.claim.claim_value.as_str());
    }

    fn read_columns(row: &TableRow) -> Result<Self> {
        Ok(Self {
            owner_id: optional_str(row, USER_ID)
                .or_else(|| optional_str(row, ROLE_ID))
                .unwrap_or_default(),
            claim: Claim::new(
                required_str(row, CLAIM_TYPE)?,
                optional_str(row, CLAIM_VALUE).unwrap_or_default(),
            ),
        })
    }
}

impl ClaimRow {
    /// Role claims carry the owner in `RoleId` instead of `UserId`.
    pub fn to_role_claim_row(&self, partition_key: &str, row_key: &str, version: crate::KeyVersion) -> TableRow {
        let mut row = self.to_row(partition_key, row_key, version);
        row.properties.remove(USER_ID);
        row.set(ROLE_ID, self.owner_id.as_str());
        row
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRow {
    pub owner_id: String,
    pub login: UserLogin,
}

impl RowMapping for LoginRow {
    fn write_columns(&self, row: &mut TableRow) {
        row.set(USER_ID, self.owner_id.as_str());
        row.set(LOGIN_PROVIDER, self.login.login_provider.as_str());
        row.set(PROVIDER_KEY, self.login.provider_key.as_str());
        row.set_opt(PROVIDER_DISPLAY_NAME, self.login.provider_display_name.as_deref());
    }

    fn read_columns(row: &TableRow) -> Result<Self> {
        Ok(Self {
            owner_id: required_str(row, USER_ID)?,
            login: UserLogin {
                login_provider: required_str(row, LOGIN_PROVIDER)?,
                provider_key: required_str(row, PROVIDER_KEY)?,
                provider_display_name: optional_str(row, PROVIDER_DISPLAY_NAME),
            },
        })
    }
}

/// Membership of a user in a role, keyed by the role key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleMembershipRow {
    pub owner_id: String,
    pub role_name: String,
}

impl RowMapping for RoleMembershipRow {
    fn write_columns(&self, row: &mut TableRow) {
        row.set(USER_ID, self.owner_id.as_str());
        row.set(ROLE_NAME, self.role_name.as_str());
    }

    fn read_columns(row: &TableRow) -> Result<Self> {
        Ok(Self {
            owner_id: required_str(row, USER_ID)?,
            role_name: required_str(row, ROLE_NAME)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRow {
    pub owner_id: String,
    pub token: UserToken,
}

impl RowMapping for TokenRow {
    fn write_columns(&self, row: &mut TableRow) {
        row.set(USER_ID, self.owner_id.as_str());
        row.set(LOGIN_PROVIDER, self.token.login_provider.as_str());
        row.set(NAME, self.token.name.as_str());
        row.set_opt(VALUE, self.token.value.as_deref());
    }

    fn read_columns(row: &TableRow) -> Result<Self> {
        Ok(Self {
            owner_id: required_str(row, USER_ID)?,
            token: UserToken {
                login_provider: required_str(row, LOGIN_PROVIDER)?,
                name: required_str(row, NAME)?,
                value: optional_str(row, VALUE),
            },
        })
    }
}
