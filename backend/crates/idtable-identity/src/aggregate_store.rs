//! Multi-row user aggregates.
//!
//! One logical user is many physical rows sharing one partition key:
//!
//! ```text
//! partition N_{hash(USERNAME)}
//!   C_{hash(type_value)}      claim rows
//!   L_{hash(provider_key)}    login rows
//!   N_{hash(USERNAME)}        entity row (row key = partition key)
//!   R_{hash(ROLE)}            role-membership rows
//!   T_{hash(provider_name)}   token rows
//! ```
//!
//! Reads range-scan the whole partition and classify rows by row-key prefix.
//! Index rows live in another table, so writes to them are never atomic with
//! the aggregate; every write here is idempotent and safe to retry.

use std::sync::Arc;

use idtable_commons::{Claim, User, UserLogin, UserToken};
use idtable_store::{query_all, MatchToken, TableOperation, TableQuery, TableRow};
use tokio_util::sync::CancellationToken;

use crate::context::IdentityContext;
use crate::error::{IdentityStoreError, Result};
use crate::index_table::IndexTable;
use crate::indexes::{entity_entries, expected_entries, stale_entries};
use crate::key_helper::{KeyHelper, KeyKind, KeyVersion};
use crate::rows::{
    key_version_of, ClaimRow, LoginRow, RoleMembershipRow, RowMapping, TokenRow, UserRow,
};

/// A user with every dependent row.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAggregate {
    /// Partition key shared by every row of the aggregate
    pub primary_key: String,
    /// Hash scheme the aggregate's keys were derived with
    pub key_version: KeyVersion,
    pub user: User,
    pub claims: Vec<Claim>,
    pub logins: Vec<UserLogin>,
    /// Role names as stored on the membership rows
    pub roles: Vec<String>,
    pub tokens: Vec<UserToken>,
}

impl UserAggregate {
    pub fn new(primary_key: impl Into<String>, key_version: KeyVersion, user: User) -> Self {
        Self {
            primary_key: primary_key.into(),
            key_version,
            user,
            claims: Vec::new(),
            logins: Vec::new(),
            roles: Vec::new(),
            tokens: Vec::new(),
        }
    }

    /// Build aggregates from rows ordered by partition key.
    ///
    /// Partitions without an entity row are skipped.
    pub fn from_rows(rows: Vec<TableRow>) -> Result<Vec<UserAggregate>> {
        let mut aggregates = Vec::new();
        let mut group: Vec<TableRow> = Vec::new();
        for row in rows {
            if group
                .first()
                .is_some_and(|first| first.partition_key != row.partition_key)
            {
                aggregates.extend(Self::from_partition(std::mem::take(&mut group))?);
            }
            group.push(row);
        }
        if !group.is_empty() {
            aggregates.extend(Self::from_partition(group)?);
        }
        Ok(aggregates)
    }

    /// Build one aggregate from the rows of a single partition.
    pub fn from_partition(rows: Vec<TableRow>) -> Result<Option<UserAggregate>> {
        let entity = match rows.iter().find(|row| UserRow::is_entity_row(row)) {
            Some(row) => row,
            None => return Ok(None),
        };
        let mut aggregate = UserAggregate::new(
            entity.partition_key.clone(),
            key_version_of(entity),
            User::read_columns(entity)?,
        );
        for row in &rows {
            if UserRow::is_entity_row(row) {
                continue;
            }
            match KeyKind::of_key(&row.row_key) {
                Some(KeyKind::Claim) => aggregate.claims.push(ClaimRow::read_columns(row)?.claim),
                Some(KeyKind::Login) => aggregate.logins.push(LoginRow::read_columns(row)?.login),
                Some(KeyKind::Role) => aggregate
                    .roles
                    .push(RoleMembershipRow::read_columns(row)?.role_name),
                Some(KeyKind::Token) => aggregate.tokens.push(TokenRow::read_columns(row)?.token),
                _ => log::debug!(
                    "Skipping unrecognized row {}/{} in user aggregate",
                    row.partition_key,
                    row.row_key
                ),
            }
        }
        Ok(Some(aggregate))
    }

    /// Every row of the aggregate, keyed under `primary_key` with `keys`.
    ///
    /// The entity row comes first.
    pub fn to_rows(&self, primary_key: &str, keys: &KeyHelper) -> Result<Vec<TableRow>> {
        let version = keys.version();
        let owner = self.user.id.as_str().to_string();
        let mut rows = vec![self.user.to_row(primary_key, primary_key, version)];
        for claim in &self.claims {
            let rk = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
            let row = ClaimRow {
                owner_id: owner.clone(),
                claim: claim.clone(),
            };
            rows.push(row.to_row(primary_key, &rk, version));
        }
        for login in &self.logins {
            let rk = keys.login_key(&login.login_provider, &login.provider_key)?;
            let row = LoginRow {
                owner_id: owner.clone(),
                login: login.clone(),
            };
            rows.push(row.to_row(primary_key, &rk, version));
        }
        for role in &self.roles {
            let rk = keys.role_key(role)?;
            let row = RoleMembershipRow {
                owner_id: owner.clone(),
                role_name: role.clone(),
            };
            rows.push(row.to_row(primary_key, &rk, version));
        }
        for token in &self.tokens {
            let rk = keys.token_key(&token.login_provider, &token.name)?;
            let row = TokenRow {
                owner_id: owner.clone(),
                token: token.clone(),
            };
            rows.push(row.to_row(primary_key, &rk, version));
        }
        Ok(rows)
    }
}

/// Reads and writes user aggregates.
#[derive(Clone)]
pub struct UserAggregateStore {
    ctx: IdentityContext,
    index: IndexTable,
}

impl UserAggregateStore {
    pub fn new(ctx: IdentityContext) -> Self {
        let index = IndexTable::from_context(&ctx);
        Self { ctx, index }
    }

    pub fn context(&self) -> &IdentityContext {
        &self.ctx
    }

    pub fn index(&self) -> &IndexTable {
        &self.index
    }

    fn table(&self) -> &str {
        &self.ctx.tables.users
    }

    /// Read the whole aggregate stored under `primary_key`.
    pub async fn read_aggregate(
        &self,
        primary_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<UserAggregate>> {
        if primary_key.is_empty() {
            return Ok(None);
        }
        let rows = query_all(
            self.ctx.store.as_ref(),
            self.table(),
            &TableQuery::partition(primary_key),
            cancel,
        )
        .await?;
        UserAggregate::from_partition(rows)
    }

    /// Read several aggregates with one OR-filtered scan.
    ///
    /// At most [`TableQuery::MAX_PARTITION_CLAUSES`] keys per call.
    pub async fn read_aggregates(
        &self,
        primary_keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<UserAggregate>> {
        if primary_keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = TableQuery::partitions(primary_keys.iter().cloned())?;
        let rows = query_all(self.ctx.store.as_ref(), self.table(), &query, cancel).await?;
        UserAggregate::from_rows(rows)
    }

    /// Point read of the entity row only.
    pub async fn read_user(
        &self,
        primary_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<(User, KeyVersion)>> {
        if primary_key.is_empty() {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        match self
            .ctx
            .store
            .get(self.table(), primary_key, primary_key, None)
            .await?
        {
            Some(row) => Ok(Some((User::read_columns(&row)?, key_version_of(&row)))),
            None => Ok(None),
        }
    }

    /// Range-scan one dependent kind of an aggregate.
    pub async fn read_dependents(
        &self,
        primary_key: &str,
        kind: KeyKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<TableRow>> {
        let (lower, upper) = KeyHelper::range(kind);
        let query = TableQuery::partition(primary_key).row_key_range(lower, upper);
        Ok(query_all(self.ctx.store.as_ref(), self.table(), &query, cancel).await?)
    }

    /// Create an aggregate and its index rows.
    ///
    /// The entity row is inserted (a duplicate user name fails with a
    /// conflict before anything else is written); dependents go in the same
    /// partition batch. Index rows are written afterwards, one write each.
    /// Returns the created user with its ETag.
    pub async fn create_aggregate(
        &self,
        aggregate: &UserAggregate,
        cancel: &CancellationToken,
    ) -> Result<User> {
        let keys = self.ctx.keys_for(aggregate.key_version);
        let pk = &aggregate.primary_key;
        let mut rows = aggregate.to_rows(pk, &keys)?.into_iter();

        let mut writer = self.ctx.batch_writer(self.table());
        if let Some(entity) = rows.next() {
            writer.add(entity);
        }
        for row in rows {
            writer.upsert(row);
        }
        let outcomes = writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| {
                let err = IdentityStoreError::from_batch("create aggregate", e);
                match err {
                    // Single partition: surface the store error directly
                    IdentityStoreError::PartialFailure { mut failures, .. } if failures.len() == 1 => {
                        IdentityStoreError::from(failures.remove(0).1)
                    }
                    other => other,
                }
            })?;

        let mut created = aggregate.user.clone();
        created.etag = outcomes
            .iter()
            .find(|o| o.row_key == *pk)
            .and_then(|o| o.etag.as_ref())
            .map(|e| e.as_str().to_string());

        let entries = expected_entries(&keys, aggregate)?;
        self.index.upsert_all(&entries, cancel).await?;
        log::debug!(
            "Created user '{}' under {} with {} index row(s)",
            aggregate.user.user_name,
            pk,
            entries.len()
        );
        Ok(created)
    }

    /// Replace the entity row of an aggregate whose primary key is unchanged,
    /// then swap entity-level index rows (stale rows deleted first).
    ///
    /// The write is conditional on `user.etag`; a stale ETag fails with a
    /// conflict and nothing else is written.
    pub async fn update_entity(
        &self,
        previous: &User,
        user: &User,
        primary_key: &str,
        version: KeyVersion,
        cancel: &CancellationToken,
    ) -> Result<User> {
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let keys = self.ctx.keys_for(version);
        let op = TableOperation::Replace {
            row: user.to_row(primary_key, primary_key, version),
            match_token: MatchToken::from_etag(user.etag.as_deref()),
        };
        let outcome = self.ctx.store.execute(self.table(), op).await?;

        let before = entity_entries(&keys, &UserAggregate::new(primary_key, version, previous.clone()))?;
        let after = entity_entries(&keys, &UserAggregate::new(primary_key, version, user.clone()))?;
        self.index
            .delete_all(&stale_entries(&before, &after), cancel)
            .await?;
        self.index.upsert_all(&after, cancel).await?;

        let mut updated = user.clone();
        updated.etag = outcome.etag.map(|e| e.as_str().to_string());
        Ok(updated)
    }

    /// Delete an aggregate and every index row derived from it.
    ///
    /// Reads the partition first to discover what exists. Index rows are
    /// deleted before the aggregate so a failure leaves the aggregate in
    /// place and a rerun rediscovers everything; within the partition the
    /// entity row goes last. Deleting an aggregate that no longer exists
    /// succeeds.
    pub async fn delete_aggregate(
        &self,
        primary_key: &str,
        expected_etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rows = query_all(
            self.ctx.store.as_ref(),
            self.table(),
            &TableQuery::partition(primary_key),
            cancel,
        )
        .await?;
        if rows.is_empty() {
            return Ok(());
        }

        let aggregate = UserAggregate::from_partition(rows.clone())?;
        if let (Some(aggregate), Some(expected)) = (&aggregate, expected_etag) {
            if aggregate.user.etag.as_deref() != Some(expected) {
                return Err(idtable_store::StorageError::PreconditionFailed {
                    partition_key: primary_key.to_string(),
                    row_key: primary_key.to_string(),
                }
                .into());
            }
        }

        if let Some(aggregate) = &aggregate {
            let keys = self.ctx.keys_for(aggregate.key_version);
            let entries = expected_entries(&keys, aggregate)?;
            self.index.delete_all(&entries, cancel).await?;
        }

        let mut writer = self.ctx.batch_writer(self.table());
        let (entity, dependents): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(UserRow::is_entity_row);
        for row in dependents {
            writer.delete(row.partition_key, row.row_key, MatchToken::Any);
        }
        for row in entity {
            let token = MatchToken::from_etag(row.etag.as_ref().map(|e| e.as_str()));
            writer.delete(row.partition_key, row.row_key, token);
        }
        writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| IdentityStoreError::from_batch("aggregate delete", e))?;
        log::debug!("Deleted user aggregate {}", primary_key);
        Ok(())
    }

    /// Apply same-partition row changes in one submit.
    pub async fn write_rows(
        &self,
        operations: Vec<TableOperation>,
        step: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        let mut writer = self.ctx.batch_writer(self.table());
        writer.extend(operations);
        writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| IdentityStoreError::from_batch(step, e))?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn idtable_store::TableStore> {
        &self.ctx.store
    }
}
