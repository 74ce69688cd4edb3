use async_trait::async_trait;
use idtable_commons::{User, UserToken};
use idtable_store::TableOperation;
use tokio_util::sync::CancellationToken;

use super::UserStore;
use crate::error::{IdentityResult, IdentityStoreError, Result};
use crate::rows::{RowMapping, TokenRow};

/// Authentication tokens stored per user, keyed by (provider, name).
///
/// Tokens are not indexed; every operation is a point access in the
/// owner's partition.
#[async_trait]
pub trait UserTokenStore {
    async fn set_token(
        &self,
        user: &User,
        token: &UserToken,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    async fn get_token(
        &self,
        user: &User,
        login_provider: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;

    async fn remove_token(
        &self,
        user: &User,
        login_provider: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;
}

#[async_trait]
impl UserTokenStore for UserStore {
    async fn set_token(
        &self,
        user: &User,
        token: &UserToken,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let keys = self.context().keys_for(located.key_version);
        let row_key = keys.token_key(&token.login_provider, &token.name)?;
        let row = TokenRow {
            owner_id: located.user.id.as_str().to_string(),
            token: token.clone(),
        };
        let operations = vec![TableOperation::InsertOrReplace(row.to_row(
            &located.primary_key,
            &row_key,
            located.key_version,
        ))];
        self.write_dependents(operations, &[], &[], "token set", cancel)
            .await
    }

    async fn get_token(
        &self,
        user: &User,
        login_provider: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let located = match self.locate(user, cancel).await? {
            Some(located) => located,
            None => return Ok(None),
        };
        let keys = self.context().keys_for(located.key_version);
        let row_key = keys.token_key(login_provider, name)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let row = self
            .context()
            .store
            .get(&self.context().tables.users, &located.primary_key, &row_key, None)
            .await?;
        match row {
            Some(row) => Ok(TokenRow::read_columns(&row)?.token.value),
            None => Ok(None),
        }
    }

    async fn remove_token(
        &self,
        user: &User,
        login_provider: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let keys = self.context().keys_for(located.key_version);
        let row_key = keys.token_key(login_provider, name)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let exists = self
            .context()
            .store
            .get(&self.context().tables.users, &located.primary_key, &row_key, None)
            .await?
            .is_some();
        if !exists {
            return Ok(IdentityResult::success());
        }
        let operations = vec![TableOperation::delete(&located.primary_key, row_key)];
        self.write_dependents(operations, &[], &[], "token remove", cancel)
            .await
    }
}
