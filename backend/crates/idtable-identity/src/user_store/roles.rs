use std::collections::BTreeMap;

use async_trait::async_trait;
use idtable_commons::{normalize_key, User};
use idtable_store::TableOperation;
use tokio_util::sync::CancellationToken;

use super::{Located, UserStore};
use crate::aggregate_store::UserAggregate;
use crate::error::{IdentityErrorCode, IdentityResult, IdentityStoreError, Result};
use crate::indexes::{RoleIndex, UserIndexDefinition};
use crate::key_helper::KeyKind;
use crate::role_store::read_role_entity;
use crate::rows::{IndexEntry, RoleMembershipRow, RowMapping};

/// Role membership of a user.
///
/// Membership rows live in the user's partition; the role index maps each
/// role to its members.
#[async_trait]
pub trait UserRoleStore {
    /// Fails with `RoleNotFound` for an unknown role and `UserAlreadyInRole`
    /// when the membership exists.
    async fn add_to_role(
        &self,
        user: &User,
        role_name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    async fn remove_from_role(
        &self,
        user: &User,
        role_name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    async fn get_roles(&self, user: &User, cancel: &CancellationToken) -> Result<Vec<String>>;

    async fn is_in_role(&self, user: &User, role_name: &str, cancel: &CancellationToken) -> Result<bool>;

    async fn get_users_in_role(&self, role_name: &str, cancel: &CancellationToken) -> Result<Vec<User>>;
}

impl UserStore {
    fn role_entries(&self, located: &Located, role_name: &str) -> Result<Vec<IndexEntry>> {
        let keys = self.context().keys_for(located.key_version);
        let mut aggregate = UserAggregate::new(
            located.primary_key.clone(),
            located.key_version,
            located.user.clone(),
        );
        aggregate.roles = vec![role_name.to_string()];
        RoleIndex.extract_entries(&keys, &aggregate)
    }

    async fn membership_exists(
        &self,
        located: &Located,
        role_name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let keys = self.context().keys_for(located.key_version);
        let row_key = keys.role_key(role_name)?;
        let row = self
            .context()
            .store
            .get(&self.context().tables.users, &located.primary_key, &row_key, None)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl UserRoleStore for UserStore {
    async fn add_to_role(
        &self,
        user: &User,
        role_name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        let normalized = normalize_role(role_name)?;
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let role = match read_role_entity(self.context(), &normalized, cancel).await? {
            Some((role, _, _)) => role,
            None => {
                return Ok(IdentityResult::failure(
                    IdentityErrorCode::RoleNotFound,
                    format!("Role {} does not exist.", role_name),
                ))
            }
        };
        if self.membership_exists(&located, &role.name, cancel).await? {
            return Ok(IdentityResult::failure(
                IdentityErrorCode::UserAlreadyInRole,
                format!("User already in role '{}'.", role.name),
            ));
        }

        let keys = self.context().keys_for(located.key_version);
        let row = RoleMembershipRow {
            owner_id: located.user.id.as_str().to_string(),
            role_name: role.name.clone(),
        };
        let operations = vec![TableOperation::InsertOrReplace(row.to_row(
            &located.primary_key,
            &keys.role_key(&role.name)?,
            located.key_version,
        ))];
        let upserts = self.role_entries(&located, &role.name)?;
        self.write_dependents(operations, &upserts, &[], "role membership add", cancel)
            .await
    }

    async fn remove_from_role(
        &self,
        user: &User,
        role_name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        normalize_role(role_name)?;
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        if !self.membership_exists(&located, role_name, cancel).await? {
            return Ok(IdentityResult::failure(
                IdentityErrorCode::UserNotInRole,
                format!("User is not in role '{}'.", role_name),
            ));
        }
        let keys = self.context().keys_for(located.key_version);
        let operations = vec![TableOperation::delete(
            &located.primary_key,
            keys.role_key(role_name)?,
        )];
        let deletes = self.role_entries(&located, role_name)?;
        self.write_dependents(operations, &[], &deletes, "role membership remove", cancel)
            .await
    }

    async fn get_roles(&self, user: &User, cancel: &CancellationToken) -> Result<Vec<String>> {
        let located = match self.locate(user, cancel).await? {
            Some(located) => located,
            None => return Ok(Vec::new()),
        };
        let rows = self
            .aggregates
            .read_dependents(&located.primary_key, KeyKind::Role, cancel)
            .await?;
        rows.iter()
            .map(|row| Ok(RoleMembershipRow::read_columns(row)?.role_name))
            .collect()
    }

    async fn is_in_role(&self, user: &User, role_name: &str, cancel: &CancellationToken) -> Result<bool> {
        normalize_role(role_name)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        match self.locate(user, cancel).await? {
            Some(located) => self.membership_exists(&located, role_name, cancel).await,
            None => Ok(false),
        }
    }

    async fn get_users_in_role(&self, role_name: &str, cancel: &CancellationToken) -> Result<Vec<User>> {
        let normalized = normalize_role(role_name)?;
        let mut users: BTreeMap<String, User> = BTreeMap::new();
        for keys in self.context().lookup_keys() {
            let partition = keys.role_key(&normalized)?;
            let resolved = self
                .fanout
                .resolve(
                    &partition,
                    |aggregate| aggregate.roles.iter().any(|r| normalize_key(r) == normalized),
                    cancel,
                )
                .await?;
            for aggregate in resolved {
                users
                    .entry(aggregate.user.id.as_str().to_string())
                    .or_insert(aggregate.user);
            }
        }
        Ok(users.into_values().collect())
    }
}

fn normalize_role(role_name: &str) -> Result<String> {
    if role_name.is_empty() {
        return Err(IdentityStoreError::validation("role name is required"));
    }
    Ok(normalize_key(role_name))
}
