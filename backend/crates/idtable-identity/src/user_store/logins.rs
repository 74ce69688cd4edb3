use async_trait::async_trait;
use idtable_commons::{User, UserLogin};
use idtable_store::TableOperation;
use tokio_util::sync::CancellationToken;

use super::UserStore;
use crate::error::{IdentityErrorCode, IdentityResult, IdentityStoreError, Result};
use crate::key_helper::KeyKind;
use crate::rows::{IndexEntry, LoginRow, RowMapping};

/// External logins linked to a user.
#[async_trait]
pub trait UserLoginStore {
    /// Fails with `LoginAlreadyAssociated` when another user owns the login.
    async fn add_login(
        &self,
        user: &User,
        login: &UserLogin,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    async fn remove_login(
        &self,
        user: &User,
        login_provider: &str,
        provider_key: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    async fn get_logins(&self, user: &User, cancel: &CancellationToken) -> Result<Vec<UserLogin>>;
}

#[async_trait]
impl UserLoginStore for UserStore {
    async fn add_login(
        &self,
        user: &User,
        login: &UserLogin,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let keys = self.context().keys_for(located.key_version);
        let login_key = keys.login_key(&login.login_provider, &login.provider_key)?;

        if let Some(owner) = self
            .find_by_login(&login.login_provider, &login.provider_key, cancel)
            .await?
        {
            if owner.id != located.user.id {
                return Ok(IdentityResult::failure(
                    IdentityErrorCode::LoginAlreadyAssociated,
                    format!("A user with login {} already exists.", login.login_provider),
                ));
            }
        }

        let row = LoginRow {
            owner_id: located.user.id.as_str().to_string(),
            login: login.clone(),
        };
        let operations = vec![TableOperation::InsertOrReplace(row.to_row(
            &located.primary_key,
            &login_key,
            located.key_version,
        ))];
        let entry = IndexEntry {
            partition_key: login_key.clone(),
            row_key: login_key,
            id: located.user.id.as_str().to_string(),
            primary_key: located.primary_key.clone(),
            key_version: located.key_version,
        };
        self.write_dependents(operations, &[entry], &[], "login add", cancel)
            .await
    }

    async fn remove_login(
        &self,
        user: &User,
        login_provider: &str,
        provider_key: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let keys = self.context().keys_for(located.key_version);
        let login_key = keys.login_key(login_provider, provider_key)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }

        let stored = self
            .context()
            .store
            .get(&self.context().tables.users, &located.primary_key, &login_key, None)
            .await?;
        let operations = match stored {
            Some(_) => vec![TableOperation::delete(&located.primary_key, &login_key)],
            None => Vec::new(),
        };

        // Only drop the index row while it still points at this user
        let mut deletes = Vec::new();
        let indexed = self
            .aggregates
            .index()
            .query_exact(&login_key, &login_key, cancel)
            .await?;
        if let Some(entry) = indexed {
            if entry.id == located.user.id.as_str() {
                deletes.push(entry);
            }
        }
        self.write_dependents(operations, &[], &deletes, "login remove", cancel)
            .await
    }

    async fn get_logins(&self, user: &User, cancel: &CancellationToken) -> Result<Vec<UserLogin>> {
        let located = match self.locate(user, cancel).await? {
            Some(located) => located,
            None => return Ok(Vec::new()),
        };
        let rows = self
            .aggregates
            .read_dependents(&located.primary_key, KeyKind::Login, cancel)
            .await?;
        rows.iter()
            .map(|row| Ok(LoginRow::read_columns(row)?.login))
            .collect()
    }
}
