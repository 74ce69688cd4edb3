//! User identity operations.
//!
//! [`UserStore`] covers the entity lifecycle (create, update, delete, find).
//! Dependent rows are handled by capability traits implemented on the same
//! store, each in its own module:
//!
//! - [`UserClaimStore`]: claims and users-for-claim
//! - [`UserLoginStore`]: external logins
//! - [`UserRoleStore`]: role membership and users-in-role
//! - [`UserTokenStore`]: authentication tokens
//!
//! Mutating operations return an [`IdentityResult`]; store failures become
//! failure codes. Lookups return `None` on a miss.

mod claims;
mod logins;
mod roles;
mod tokens;

pub use claims::UserClaimStore;
pub use logins::UserLoginStore;
pub use roles::UserRoleStore;
pub use tokens::UserTokenStore;

use idtable_commons::{normalize_key, now_millis, User};
use idtable_store::{StorageError, TableOperation};
use tokio_util::sync::CancellationToken;

use crate::aggregate_store::{UserAggregate, UserAggregateStore};
use crate::context::IdentityContext;
use crate::error::{IdentityErrorCode, IdentityResult, IdentityStoreError, Result};
use crate::fanout::{FanoutOptions, FanoutQueryEngine};
use crate::key_helper::{KeyHelper, KeyVersion};
use crate::repartition::RepartitionProtocol;

/// Where a user's aggregate currently lives.
#[derive(Debug, Clone)]
pub(crate) struct Located {
    pub primary_key: String,
    pub key_version: KeyVersion,
    /// Entity row as stored
    pub user: User,
}

/// Identity operations over user aggregates.
#[derive(Clone)]
pub struct UserStore {
    aggregates: UserAggregateStore,
    fanout: FanoutQueryEngine,
    repartition: RepartitionProtocol,
}

impl UserStore {
    pub fn new(ctx: IdentityContext) -> Self {
        let aggregates = UserAggregateStore::new(ctx);
        Self {
            fanout: FanoutQueryEngine::new(aggregates.clone()),
            repartition: RepartitionProtocol::new(aggregates.clone()),
            aggregates,
        }
    }

    pub fn with_fanout_options(mut self, options: FanoutOptions) -> Self {
        self.fanout = self.fanout.with_options(options);
        self
    }

    pub fn context(&self) -> &IdentityContext {
        self.aggregates.context()
    }

    pub fn aggregates(&self) -> &UserAggregateStore {
        &self.aggregates
    }

    pub fn fanout(&self) -> &FanoutQueryEngine {
        &self.fanout
    }

    /// Create `user` with its username, id and email index rows.
    ///
    /// On success `user.etag` holds the stored entity row's ETag.
    pub async fn create(&self, user: &mut User, cancel: &CancellationToken) -> Result<IdentityResult> {
        validate_user(user)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let ctx = self.context();
        if let Some(legacy) = &ctx.legacy_keys {
            let legacy_key = legacy.user_key(&user.normalized_user_name)?;
            if self.read_verified(&legacy_key, legacy, |_| true, cancel).await?.is_some() {
                return Ok(duplicate_user_name(&user.user_name));
            }
        }

        let primary_key = ctx.keys.user_key(&user.normalized_user_name)?;
        let aggregate = UserAggregate::new(primary_key, ctx.keys.version(), user.clone());
        match self.aggregates.create_aggregate(&aggregate, cancel).await {
            Ok(created) => {
                *user = created;
                Ok(IdentityResult::success())
            }
            Err(IdentityStoreError::Storage(StorageError::Conflict { .. })) => {
                Ok(duplicate_user_name(&user.user_name))
            }
            Err(err) => IdentityResult::from_error(err),
        }
    }

    /// Persist changes to `user`'s entity row.
    ///
    /// The write is conditional on `user.etag` when set. A changed user name
    /// moves the whole aggregate to the key derived from the new name; the
    /// stable id is unchanged.
    pub async fn update(&self, user: &mut User, cancel: &CancellationToken) -> Result<IdentityResult> {
        validate_user(user)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let located = match self.locate(user, cancel).await? {
            Some(located) => located,
            None => return Ok(user_not_found(user)),
        };
        user.updated_at = now_millis();

        if located.user.normalized_user_name != user.normalized_user_name {
            let target_keys = self.context().keys.clone();
            let moved = self
                .repartition
                .move_aggregate(
                    &located.primary_key,
                    user.etag.as_deref(),
                    user,
                    &target_keys,
                    cancel,
                )
                .await;
            return match moved {
                Ok(Some(outcome)) => {
                    *user = outcome.user;
                    Ok(IdentityResult::success())
                }
                Ok(None) => Ok(user_not_found(user)),
                Err(IdentityStoreError::Storage(StorageError::Conflict { .. })) => {
                    Ok(duplicate_user_name(&user.user_name))
                }
                Err(err) => IdentityResult::from_error(err),
            };
        }

        match self
            .aggregates
            .update_entity(
                &located.user,
                user,
                &located.primary_key,
                located.key_version,
                cancel,
            )
            .await
        {
            Ok(updated) => {
                *user = updated;
                Ok(IdentityResult::success())
            }
            Err(err) => IdentityResult::from_error(err),
        }
    }

    /// Delete `user`, every dependent row and every index row derived from it.
    ///
    /// Deleting a user that no longer exists succeeds.
    pub async fn delete(&self, user: &User, cancel: &CancellationToken) -> Result<IdentityResult> {
        validate_user(user)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let located = match self.locate(user, cancel).await? {
            Some(located) => located,
            None => return Ok(IdentityResult::success()),
        };
        match self
            .aggregates
            .delete_aggregate(&located.primary_key, user.etag.as_deref(), cancel)
            .await
        {
            Ok(()) => Ok(IdentityResult::success()),
            Err(err) => IdentityResult::from_error(err),
        }
    }

    /// Change the user name and persist it (moves the aggregate).
    pub async fn set_user_name(
        &self,
        user: &mut User,
        user_name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        if user_name.is_empty() {
            return Err(IdentityStoreError::validation("user name is required"));
        }
        user.set_user_name(user_name);
        self.update(user, cancel).await
    }

    /// Finish a rename that failed part-way (e.g. the old rows could not be
    /// deleted): whatever is still stored under `previous_user_name` for this
    /// user is moved onto `user`'s current name.
    ///
    /// Succeeds without writing when nothing is left under the old name.
    pub async fn resume_rename(
        &self,
        user: &mut User,
        previous_user_name: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        validate_user(user)?;
        if previous_user_name.is_empty() {
            return Err(IdentityStoreError::validation("previous user name is required"));
        }
        let previous = normalize_key(previous_user_name);
        if previous == user.normalized_user_name {
            return Err(IdentityStoreError::validation("previous and current user name are the same"));
        }
        let id = user.id.as_str().to_string();

        let mut source = None;
        for keys in self.context().lookup_keys() {
            let primary_key = keys.user_key(&previous)?;
            source = self
                .read_verified(&primary_key, keys, |u| u.id.as_str() == id, cancel)
                .await?;
            if source.is_some() {
                break;
            }
        }
        let source = match source {
            Some(source) => source,
            None => return Ok(IdentityResult::success()),
        };

        // Prefer the copy already written under the new key
        let target_keys = self.context().keys.clone();
        let target_key = target_keys.user_key(&user.normalized_user_name)?;
        let mut content = match self
            .read_verified(&target_key, &target_keys, |u| u.id.as_str() == id, cancel)
            .await?
        {
            Some(target) => target.user,
            None => user.clone(),
        };
        content.etag = None;

        log::info!(
            "Resuming rename of user {} from {} to {}",
            id,
            source.primary_key,
            target_key
        );
        match self
            .repartition
            .move_aggregate(&source.primary_key, None, &content, &target_keys, cancel)
            .await
        {
            Ok(Some(outcome)) => {
                *user = outcome.user;
                Ok(IdentityResult::success())
            }
            Ok(None) => Ok(IdentityResult::success()),
            Err(IdentityStoreError::Storage(StorageError::Conflict { .. })) => {
                Ok(duplicate_user_name(&user.user_name))
            }
            Err(err) => IdentityResult::from_error(err),
        }
    }

    /// Change (or clear) the email and persist it.
    pub async fn set_email(
        &self,
        user: &mut User,
        email: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        user.set_email(email.map(str::to_string));
        user.email_confirmed = false;
        self.update(user, cancel).await
    }

    pub async fn find_by_id(&self, user_id: &str, cancel: &CancellationToken) -> Result<Option<User>> {
        if user_id.is_empty() {
            return Err(IdentityStoreError::validation("user id is required"));
        }
        Ok(self.locate_by_id(user_id, cancel).await?.map(|l| l.user))
    }

    /// Point read of the entity row derived from `user_name`.
    pub async fn find_by_name(&self, user_name: &str, cancel: &CancellationToken) -> Result<Option<User>> {
        if user_name.is_empty() {
            return Err(IdentityStoreError::validation("user name is required"));
        }
        let normalized = normalize_key(user_name);
        Ok(self
            .locate_by_name(&normalized, cancel)
            .await?
            .map(|located| located.user))
    }

    /// Resolve through the email index, re-verifying each hit against the
    /// entity row.
    pub async fn find_by_email(&self, email: &str, cancel: &CancellationToken) -> Result<Option<User>> {
        if email.is_empty() {
            return Err(IdentityStoreError::validation("email is required"));
        }
        let normalized = normalize_key(email);
        for keys in self.context().lookup_keys() {
            let partition = keys.email_key(Some(&normalized));
            let entries = self
                .aggregates
                .index()
                .query_all_by_partition(&partition, cancel)
                .await?;
            for entry in entries.into_iter().filter(|e| e.key_version == keys.version()) {
                let hit = self
                    .read_verified(
                        &entry.primary_key,
                        keys,
                        |u| {
                            u.id.as_str() == entry.id
                                && u.normalized_email.as_deref() == Some(normalized.as_str())
                        },
                        cancel,
                    )
                    .await?;
                match hit {
                    Some(located) => return Ok(Some(located.user)),
                    None => log::debug!(
                        "Ignoring stale email index row {}/{}",
                        entry.partition_key,
                        entry.row_key
                    ),
                }
            }
        }
        Ok(None)
    }

    /// Exact login-index lookup, confirmed by the login row in the owner's
    /// partition.
    pub async fn find_by_login(
        &self,
        login_provider: &str,
        provider_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<User>> {
        for keys in self.context().lookup_keys() {
            let login_key = keys.login_key(login_provider, provider_key)?;
            let entry = match self
                .aggregates
                .index()
                .query_exact(&login_key, &login_key, cancel)
                .await?
            {
                Some(entry) if entry.key_version == keys.version() => entry,
                _ => continue,
            };
            let located = self
                .read_verified(&entry.primary_key, keys, |u| u.id.as_str() == entry.id, cancel)
                .await?;
            if let Some(located) = located {
                if cancel.is_cancelled() {
                    return Err(IdentityStoreError::Cancelled);
                }
                let login_row = self
                    .context()
                    .store
                    .get(&self.context().tables.users, &located.primary_key, &login_key, None)
                    .await?;
                if login_row.is_some() {
                    return Ok(Some(located.user));
                }
            }
            log::debug!("Ignoring stale login index row {}", login_key);
        }
        Ok(None)
    }

    /// Find where `user` is stored: by its id, then by its current name.
    pub(crate) async fn locate(&self, user: &User, cancel: &CancellationToken) -> Result<Option<Located>> {
        if let Some(located) = self.locate_by_id(user.id.as_str(), cancel).await? {
            return Ok(Some(located));
        }
        let id = user.id.as_str();
        for keys in self.context().lookup_keys() {
            let primary_key = keys.user_key(&user.normalized_user_name)?;
            let located = self
                .read_verified(&primary_key, keys, |u| u.id.as_str() == id, cancel)
                .await?;
            if let Some(located) = located {
                log::debug!("Located user {} by name; id index row missing", id);
                return Ok(Some(located));
            }
        }
        Ok(None)
    }

    /// Like [`Self::locate`] but reports a missing user as a failure result.
    pub(crate) async fn locate_or_fail(
        &self,
        user: &User,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<Located, IdentityResult>> {
        validate_user(user)?;
        Ok(self.locate(user, cancel).await?.ok_or_else(|| user_not_found(user)))
    }

    async fn locate_by_id(&self, user_id: &str, cancel: &CancellationToken) -> Result<Option<Located>> {
        for keys in self.context().lookup_keys() {
            let id_key = keys.user_id_key(user_id)?;
            let entry = match self.aggregates.index().query_exact(&id_key, &id_key, cancel).await? {
                Some(entry) => entry,
                None => continue,
            };
            let located = self
                .read_verified(
                    &entry.primary_key,
                    &self.context().keys_for(entry.key_version),
                    |u| u.id.as_str() == user_id,
                    cancel,
                )
                .await?;
            match located {
                Some(located) => return Ok(Some(located)),
                None => log::debug!("Ignoring stale id index row {}", id_key),
            }
        }
        Ok(None)
    }

    async fn locate_by_name(&self, normalized: &str, cancel: &CancellationToken) -> Result<Option<Located>> {
        for keys in self.context().lookup_keys() {
            let primary_key = keys.user_key(normalized)?;
            let located = self
                .read_verified(&primary_key, keys, |u| u.normalized_user_name == normalized, cancel)
                .await?;
            if let Some(located) = located {
                if keys.version() != self.context().keys.version() {
                    log::debug!("Resolved user {} through legacy keys", located.user.id);
                }
                return Ok(Some(located));
            }
        }
        Ok(None)
    }

    /// Point read of an entity row written with `keys`, accepted only when
    /// `verify` holds.
    async fn read_verified<F>(
        &self,
        primary_key: &str,
        keys: &KeyHelper,
        verify: F,
        cancel: &CancellationToken,
    ) -> Result<Option<Located>>
    where
        F: Fn(&User) -> bool,
    {
        match self.aggregates.read_user(primary_key, cancel).await? {
            Some((user, version)) if version == keys.version() && verify(&user) => Ok(Some(Located {
                primary_key: primary_key.to_string(),
                key_version: version,
                user,
            })),
            _ => Ok(None),
        }
    }

    /// Apply same-partition row changes, then index changes, as one logical
    /// step.
    pub(crate) async fn write_dependents(
        &self,
        operations: Vec<TableOperation>,
        upserts: &[crate::rows::IndexEntry],
        deletes: &[crate::rows::IndexEntry],
        step: &str,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        let written = async {
            self.aggregates.write_rows(operations, step, cancel).await?;
            self.aggregates.index().upsert_all(upserts, cancel).await?;
            self.aggregates.index().delete_all(deletes, cancel).await
        }
        .await;
        match written {
            Ok(()) => Ok(IdentityResult::success()),
            Err(err) => IdentityResult::from_error(err),
        }
    }
}

fn validate_user(user: &User) -> Result<()> {
    if user.id.as_str().is_empty() {
        return Err(IdentityStoreError::validation("user id is required"));
    }
    if user.normalized_user_name.is_empty() {
        return Err(IdentityStoreError::validation("user name is required"));
    }
    Ok(())
}

fn duplicate_user_name(user_name: &str) -> IdentityResult {
    IdentityResult::failure(
        IdentityErrorCode::DuplicateUserName,
        format!("User name '{}' is already taken.", user_name),
    )
}

pub(crate) fn user_not_found(user: &User) -> IdentityResult {
    IdentityResult::failure(
        IdentityErrorCode::UserNotFound,
        format!("User {} not found.", user.id),
    )
}
