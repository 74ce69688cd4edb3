//! Role aggregates and role lifecycle.
//!
//! ```text
//! roles table
//!   partition R_{hash(ROLE)}
//!     C_{hash(type_value)}    role claim rows (owner in RoleId)
//!     R_{hash(ROLE)}          entity row (row key = partition key)
//!   partition U_{hash(id)}
//!     U_{hash(id)}            role id -> current primary key
//! ```
//!
//! Memberships are stored on the user side: a row under the user's
//! partition plus a role index row. Renaming or deleting a role therefore
//! fans out over the role index to rewrite every member.

use std::collections::HashSet;

use idtable_commons::{normalize_key, Claim, Role};
use idtable_store::{query_all, MatchToken, StorageError, TableOperation, TableQuery, TableRow};
use tokio_util::sync::CancellationToken;

use crate::aggregate_store::{UserAggregate, UserAggregateStore};
use crate::context::IdentityContext;
use crate::error::{IdentityErrorCode, IdentityResult, IdentityStoreError, Result};
use crate::fanout::{FanoutOptions, FanoutQueryEngine};
use crate::index_table::IndexTable;
use crate::indexes::{RoleIndex, UserIndexDefinition};
use crate::key_helper::{KeyHelper, KeyKind, KeyVersion};
use crate::rows::{key_version_of, ClaimRow, IndexEntry, RoleMembershipRow, RoleRow, RowMapping};

/// A role with its claims.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleAggregate {
    pub primary_key: String,
    pub key_version: KeyVersion,
    pub role: Role,
    pub claims: Vec<Claim>,
}

impl RoleAggregate {
    pub fn new(primary_key: impl Into<String>, key_version: KeyVersion, role: Role) -> Self {
        Self {
            primary_key: primary_key.into(),
            key_version,
            role,
            claims: Vec::new(),
        }
    }

    pub fn from_partition(rows: &[TableRow]) -> Result<Option<RoleAggregate>> {
        let entity = match rows.iter().find(|row| RoleRow::is_entity_row(row)) {
            Some(row) => row,
            None => return Ok(None),
        };
        let mut aggregate = RoleAggregate::new(
            entity.partition_key.clone(),
            key_version_of(entity),
            Role::read_columns(entity)?,
        );
        for row in rows {
            if KeyKind::of_key(&row.row_key) == Some(KeyKind::Claim) {
                aggregate.claims.push(ClaimRow::read_columns(row)?.claim);
            }
        }
        Ok(Some(aggregate))
    }

    /// Every row under `primary_key`, entity first.
    pub fn to_rows(&self, primary_key: &str, keys: &KeyHelper) -> Result<Vec<TableRow>> {
        let version = keys.version();
        let mut rows = vec![self.role.to_row(primary_key, primary_key, version)];
        for claim in &self.claims {
            let row = ClaimRow {
                owner_id: self.role.id.as_str().to_string(),
                claim: claim.clone(),
            };
            let row_key = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
            rows.push(row.to_role_claim_row(primary_key, &row_key, version));
        }
        Ok(rows)
    }

    /// Role id index row pointing at `primary_key`.
    fn id_entry(&self, primary_key: &str, keys: &KeyHelper) -> Result<IndexEntry> {
        let key = keys.role_id_key(self.role.id.as_str())?;
        Ok(IndexEntry {
            partition_key: key.clone(),
            row_key: key,
            id: self.role.id.as_str().to_string(),
            primary_key: primary_key.to_string(),
            key_version: keys.version(),
        })
    }
}

/// Read a role entity row by normalized name, current keys first.
pub(crate) async fn read_role_entity(
    ctx: &IdentityContext,
    normalized_name: &str,
    cancel: &CancellationToken,
) -> Result<Option<(Role, String, KeyVersion)>> {
    for keys in ctx.lookup_keys() {
        let primary_key = keys.role_key(normalized_name)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        if let Some(row) = ctx
            .store
            .get(&ctx.tables.roles, &primary_key, &primary_key, None)
            .await?
        {
            let version = key_version_of(&row);
            let role = Role::read_columns(&row)?;
            if version == keys.version() && role.normalized_name == normalized_name {
                return Ok(Some((role, primary_key, version)));
            }
        }
    }
    Ok(None)
}

/// Identity operations over role aggregates.
#[derive(Clone)]
pub struct RoleStore {
    ctx: IdentityContext,
    /// Role id index rows, kept in the roles table
    role_ids: IndexTable,
    /// User-side index holding role membership rows
    index: IndexTable,
    fanout: FanoutQueryEngine,
}

impl RoleStore {
    pub fn new(ctx: IdentityContext) -> Self {
        let aggregates = UserAggregateStore::new(ctx.clone());
        Self {
            role_ids: IndexTable::new(ctx.store.clone(), ctx.tables.roles.clone()),
            index: aggregates.index().clone(),
            fanout: FanoutQueryEngine::new(aggregates),
            ctx,
        }
    }

    pub fn with_fanout_options(mut self, options: FanoutOptions) -> Self {
        self.fanout = self.fanout.with_options(options);
        self
    }

    pub async fn create(&self, role: &mut Role, cancel: &CancellationToken) -> Result<IdentityResult> {
        validate_role(role)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        if read_role_entity(&self.ctx, &role.normalized_name, cancel).await?.is_some() {
            return Ok(duplicate_role_name(&role.name));
        }

        let keys = &self.ctx.keys;
        let primary_key = keys.role_key(&role.normalized_name)?;
        let aggregate = RoleAggregate::new(primary_key.clone(), keys.version(), role.clone());
        let insert = TableOperation::Insert(role.to_row(&primary_key, &primary_key, keys.version()));
        let outcome = match self.ctx.store.execute(&self.ctx.tables.roles, insert).await {
            Ok(outcome) => outcome,
            Err(StorageError::Conflict { .. }) => return Ok(duplicate_role_name(&role.name)),
            Err(err) => return IdentityResult::from_error(err.into()),
        };
        role.etag = outcome.etag.map(|e| e.as_str().to_string());

        if let Err(err) = self
            .role_ids
            .upsert(&aggregate.id_entry(&primary_key, keys)?, cancel)
            .await
        {
            return IdentityResult::from_error(err);
        }
        log::debug!("Created role '{}' under {}", role.name, primary_key);
        Ok(IdentityResult::success())
    }

    /// Persist changes to `role`. A changed name moves the role aggregate
    /// and rewrites every membership.
    pub async fn update(&self, role: &mut Role, cancel: &CancellationToken) -> Result<IdentityResult> {
        validate_role(role)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let located = match self.locate(role, cancel).await? {
            Some(located) => located,
            None => return Ok(role_not_found(&role.name)),
        };

        if located.role.normalized_name != role.normalized_name {
            return match self.rename(&located, role, cancel).await {
                Ok(renamed) => {
                    *role = renamed;
                    Ok(IdentityResult::success())
                }
                Err(IdentityStoreError::Storage(StorageError::Conflict { .. })) => {
                    Ok(duplicate_role_name(&role.name))
                }
                Err(err) => IdentityResult::from_error(err),
            };
        }

        let op = TableOperation::Replace {
            row: role.to_row(&located.primary_key, &located.primary_key, located.key_version),
            match_token: MatchToken::from_etag(role.etag.as_deref()),
        };
        match self.ctx.store.execute(&self.ctx.tables.roles, op).await {
            Ok(outcome) => {
                role.etag = outcome.etag.map(|e| e.as_str().to_string());
                Ok(IdentityResult::success())
            }
            Err(err) => IdentityResult::from_error(err.into()),
        }
    }

    /// Delete a role, its claims and every membership of it.
    pub async fn delete(&self, role: &Role, cancel: &CancellationToken) -> Result<IdentityResult> {
        validate_role(role)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let located = match self.locate(role, cancel).await? {
            Some(located) => located,
            None => return Ok(IdentityResult::success()),
        };
        if let Some(expected) = role.etag.as_deref() {
            if located.role.etag.as_deref() != Some(expected) {
                return IdentityResult::from_error(
                    StorageError::PreconditionFailed {
                        partition_key: located.primary_key.clone(),
                        row_key: located.primary_key.clone(),
                    }
                    .into(),
                );
            }
        }

        let deleted = async {
            let members = self.remove_memberships(&located.role.name, cancel).await?;
            let keys = self.ctx.keys_for(located.key_version);
            let id_key = keys.role_id_key(located.role.id.as_str())?;
            self.role_ids.delete(&id_key, &id_key, MatchToken::Any, cancel).await?;
            self.delete_role_rows(&located.primary_key, role.etag.as_deref(), cancel)
                .await?;
            Ok::<_, IdentityStoreError>(members)
        }
        .await;
        match deleted {
            Ok(members) => {
                log::debug!("Deleted role '{}' ({} membership(s) removed)", located.role.name, members);
                Ok(IdentityResult::success())
            }
            Err(err) => IdentityResult::from_error(err),
        }
    }

    pub async fn find_by_id(&self, role_id: &str, cancel: &CancellationToken) -> Result<Option<Role>> {
        if role_id.is_empty() {
            return Err(IdentityStoreError::validation("role id is required"));
        }
        Ok(self.locate_by_id(role_id, cancel).await?.map(|l| l.role))
    }

    pub async fn find_by_name(&self, role_name: &str, cancel: &CancellationToken) -> Result<Option<Role>> {
        if role_name.is_empty() {
            return Err(IdentityStoreError::validation("role name is required"));
        }
        Ok(read_role_entity(&self.ctx, &normalize_key(role_name), cancel)
            .await?
            .map(|(role, _, _)| role))
    }

    pub async fn get_claims(&self, role: &Role, cancel: &CancellationToken) -> Result<Vec<Claim>> {
        let located = match self.locate(role, cancel).await? {
            Some(located) => located,
            None => return Ok(Vec::new()),
        };
        let (lower, upper) = KeyHelper::range(KeyKind::Claim);
        let query = TableQuery::partition(&located.primary_key).row_key_range(lower, upper);
        let rows = query_all(self.ctx.store.as_ref(), &self.ctx.tables.roles, &query, cancel).await?;
        rows.iter()
            .map(|row| Ok(ClaimRow::read_columns(row)?.claim))
            .collect()
    }

    pub async fn add_claim(
        &self,
        role: &Role,
        claim: &Claim,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let located = match self.locate(role, cancel).await? {
            Some(located) => located,
            None => return Ok(role_not_found(&role.name)),
        };
        let keys = self.ctx.keys_for(located.key_version);
        let row_key = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let row = ClaimRow {
            owner_id: located.role.id.as_str().to_string(),
            claim: claim.clone(),
        }
        .to_role_claim_row(&located.primary_key, &row_key, located.key_version);
        match self
            .ctx
            .store
            .execute(&self.ctx.tables.roles, TableOperation::InsertOrReplace(row))
            .await
        {
            Ok(_) => Ok(IdentityResult::success()),
            Err(err) => IdentityResult::from_error(err.into()),
        }
    }

    /// Removing a claim the role does not hold is a no-op.
    pub async fn remove_claim(
        &self,
        role: &Role,
        claim: &Claim,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let located = match self.locate(role, cancel).await? {
            Some(located) => located,
            None => return Ok(role_not_found(&role.name)),
        };
        let keys = self.ctx.keys_for(located.key_version);
        let row_key = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let delete = TableOperation::delete(&located.primary_key, row_key);
        match self.ctx.store.execute(&self.ctx.tables.roles, delete).await {
            Ok(_) => Ok(IdentityResult::success()),
            Err(err) if err.is_not_found() => Ok(IdentityResult::success()),
            Err(err) => IdentityResult::from_error(err.into()),
        }
    }

    async fn locate(&self, role: &Role, cancel: &CancellationToken) -> Result<Option<LocatedRole>> {
        if let Some(located) = self.locate_by_id(role.id.as_str(), cancel).await? {
            return Ok(Some(located));
        }
        // Id index row missing; fall back to the name the caller holds
        Ok(read_role_entity(&self.ctx, &role.normalized_name, cancel)
            .await?
            .filter(|(stored, _, _)| stored.id == role.id)
            .map(|(role, primary_key, key_version)| LocatedRole {
                primary_key,
                key_version,
                role,
            }))
    }

    async fn locate_by_id(&self, role_id: &str, cancel: &CancellationToken) -> Result<Option<LocatedRole>> {
        for keys in self.ctx.lookup_keys() {
            let id_key = keys.role_id_key(role_id)?;
            let entry = match self.role_ids.query_exact(&id_key, &id_key, cancel).await? {
                Some(entry) => entry,
                None => continue,
            };
            if cancel.is_cancelled() {
                return Err(IdentityStoreError::Cancelled);
            }
            let row = self
                .ctx
                .store
                .get(&self.ctx.tables.roles, &entry.primary_key, &entry.primary_key, None)
                .await?;
            if let Some(row) = row {
                let role = Role::read_columns(&row)?;
                if role.id.as_str() == role_id {
                    return Ok(Some(LocatedRole {
                        primary_key: entry.primary_key,
                        key_version: key_version_of(&row),
                        role,
                    }));
                }
            }
            log::debug!("Ignoring stale role id index row {}", id_key);
        }
        Ok(None)
    }

    /// Move the role aggregate to the key of its new name: insert new rows,
    /// repoint the id index, rewrite memberships, then delete the old rows.
    async fn rename(&self, located: &LocatedRole, role: &Role, cancel: &CancellationToken) -> Result<Role> {
        let roles_table = &self.ctx.tables.roles;
        let rows = query_all(
            self.ctx.store.as_ref(),
            roles_table,
            &TableQuery::partition(&located.primary_key),
            cancel,
        )
        .await?;
        let source = RoleAggregate::from_partition(&rows)?.ok_or_else(|| {
            IdentityStoreError::from(StorageError::NotFound {
                partition_key: located.primary_key.clone(),
                row_key: located.primary_key.clone(),
            })
        })?;
        if let Some(expected) = role.etag.as_deref() {
            if source.role.etag.as_deref() != Some(expected) {
                return Err(StorageError::PreconditionFailed {
                    partition_key: located.primary_key.clone(),
                    row_key: located.primary_key.clone(),
                }
                .into());
            }
        }

        let keys = self.ctx.keys.clone();
        let target_key = keys.role_key(&role.normalized_name)?;
        let occupant = read_role_entity(&self.ctx, &role.normalized_name, cancel).await?;
        if let Some((occupant, _, _)) = occupant {
            if occupant.id != role.id {
                return Err(StorageError::Conflict {
                    partition_key: target_key.clone(),
                    row_key: target_key,
                }
                .into());
            }
        }
        let mut target = source.clone();
        target.primary_key = target_key.clone();
        target.key_version = keys.version();
        target.role = role.clone();
        target.role.etag = None;

        let mut writer = self.ctx.batch_writer(roles_table);
        for row in target.to_rows(&target_key, &keys)? {
            writer.upsert(row);
        }
        let outcomes = writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| IdentityStoreError::from_batch("role rename insert", e))?;

        self.role_ids
            .upsert(&target.id_entry(&target_key, &keys)?, cancel)
            .await?;
        let members = self
            .rewrite_memberships(&source.role.name, &target.role.name, cancel)
            .await?;
        self.delete_role_rows(&located.primary_key, source.role.etag.as_deref(), cancel)
            .await?;

        let mut renamed = target.role;
        renamed.etag = outcomes
            .iter()
            .find(|o| o.row_key == target_key)
            .and_then(|o| o.etag.as_ref())
            .map(|e| e.as_str().to_string());
        log::info!(
            "Renamed role '{}' to '{}' ({} -> {}, {} member(s) rewritten)",
            source.role.name,
            renamed.name,
            located.primary_key,
            target_key,
            members
        );
        Ok(renamed)
    }

    /// Every user aggregate currently holding `role_name`.
    async fn members(
        &self,
        role_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UserAggregate>> {
        let normalized = normalize_key(role_name);
        let mut seen = HashSet::new();
        let mut members = Vec::new();
        for keys in self.ctx.lookup_keys() {
            let partition = keys.role_key(&normalized)?;
            let resolved = self
                .fanout
                .resolve(
                    &partition,
                    |aggregate| aggregate.roles.iter().any(|r| normalize_key(r) == normalized),
                    cancel,
                )
                .await?;
            members.extend(
                resolved
                    .into_iter()
                    .filter(|aggregate| seen.insert(aggregate.primary_key.clone())),
            );
        }
        Ok(members)
    }

    /// Point every membership of `old_name` at `new_name`.
    async fn rewrite_memberships(
        &self,
        old_name: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let members = self.members(old_name, cancel).await?;
        let mut writer = self.ctx.batch_writer(&self.ctx.tables.users);
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for member in &members {
            let keys = self.ctx.keys_for(member.key_version);
            let stored_name = member
                .roles
                .iter()
                .find(|r| normalize_key(r) == normalize_key(old_name))
                .cloned()
                .unwrap_or_else(|| old_name.to_string());
            let row = RoleMembershipRow {
                owner_id: member.user.id.as_str().to_string(),
                role_name: new_name.to_string(),
            };
            writer.upsert(row.to_row(&member.primary_key, &keys.role_key(new_name)?, member.key_version));
            writer.delete(
                member.primary_key.clone(),
                keys.role_key(&stored_name)?,
                MatchToken::Any,
            );

            let mut before = member.clone();
            before.roles = vec![stored_name];
            deletes.extend(RoleIndex.extract_entries(&keys, &before)?);
            let mut after = member.clone();
            after.roles = vec![new_name.to_string()];
            upserts.extend(RoleIndex.extract_entries(&keys, &after)?);
        }
        writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| IdentityStoreError::from_batch("role membership rewrite", e))?;
        self.index.upsert_all(&upserts, cancel).await?;
        self.index.delete_all(&deletes, cancel).await?;
        Ok(members.len())
    }

    /// Drop every membership of `role_name` and its role index rows.
    async fn remove_memberships(&self, role_name: &str, cancel: &CancellationToken) -> Result<usize> {
        let members = self.members(role_name, cancel).await?;
        let mut writer = self.ctx.batch_writer(&self.ctx.tables.users);
        let mut deletes = Vec::new();
        for member in &members {
            let keys = self.ctx.keys_for(member.key_version);
            writer.delete(
                member.primary_key.clone(),
                keys.role_key(role_name)?,
                MatchToken::Any,
            );
            let mut before = member.clone();
            before.roles = vec![role_name.to_string()];
            deletes.extend(RoleIndex.extract_entries(&keys, &before)?);
        }
        writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| IdentityStoreError::from_batch("role membership removal", e))?;
        self.index.delete_all(&deletes, cancel).await?;
        Ok(members.len())
    }

    /// Delete every row of a role partition, entity last.
    async fn delete_role_rows(
        &self,
        primary_key: &str,
        expected_etag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rows = query_all(
            self.ctx.store.as_ref(),
            &self.ctx.tables.roles,
            &TableQuery::partition(primary_key),
            cancel,
        )
        .await?;
        let mut writer = self.ctx.batch_writer(&self.ctx.tables.roles);
        let (entity, dependents): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(RoleRow::is_entity_row);
        for row in dependents {
            writer.delete(row.partition_key, row.row_key, MatchToken::Any);
        }
        for row in entity {
            writer.delete(row.partition_key, row.row_key, MatchToken::from_etag(expected_etag));
        }
        writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| IdentityStoreError::from_batch("role delete", e))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LocatedRole {
    primary_key: String,
    key_version: KeyVersion,
    role: Role,
}

fn validate_role(role: &Role) -> Result<()> {
    if role.id.as_str().is_empty() {
        return Err(IdentityStoreError::validation("role id is required"));
    }
    if role.normalized_name.is_empty() {
        return Err(IdentityStoreError::validation("role name is required"));
    }
    Ok(())
}

fn duplicate_role_name(name: &str) -> IdentityResult {
    IdentityResult::failure(
        IdentityErrorCode::DuplicateRoleName,
        format!("Role name '{}' is already taken.", name),
    )
}

fn role_not_found(name: &str) -> IdentityResult {
    IdentityResult::failure(
        IdentityErrorCode::RoleNotFound,
        format!("Role {} does not exist.", name),
    )
}
