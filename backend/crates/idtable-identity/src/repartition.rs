//! Moving a user aggregate to a new primary key.
//!
//! The primary key is derived from the user name (and the hash scheme), so a
//! rename or a key-format migration moves the whole aggregate. Steps, in
//! order:
//!
//! 1. read every row under the old key
//! 2. derive the new key
//! 3. insert-or-replace every row under the new key (dependent row keys are
//!    re-derived, the entity row key becomes the new key)
//! 4. repoint every index row (username, id, email, login, claim, role) at
//!    the new key
//! 5. delete every row under the old key, entity row last
//! 6. delete index rows that only made sense under the old key
//!
//! Nothing is deleted before the new rows exist, so a crash at any point
//! leaves the user readable (possibly duplicated), never lost. Every step is
//! idempotent: rerunning a failed move from the old key completes it.
//!
//! The old primary key does not stay resolvable after a move; the stable
//! user id and its index row carry identity across renames.

use idtable_commons::User;
use idtable_store::{query_all, MatchToken, StorageError, TableQuery};
use tokio_util::sync::CancellationToken;

use crate::aggregate_store::{UserAggregate, UserAggregateStore};
use crate::error::{IdentityStoreError, Result};
use crate::indexes::{expected_entries, stale_entries};
use crate::key_helper::KeyHelper;
use crate::rows::UserRow;

/// What a completed move did.
#[derive(Debug, Clone, PartialEq)]
pub struct RepartitionOutcome {
    pub old_primary_key: String,
    pub new_primary_key: String,
    /// The user as stored under the new key, with its new ETag
    pub user: User,
    pub rows_moved: usize,
    pub index_rows_written: usize,
    pub stale_index_rows_removed: usize,
}

/// Moves aggregates between primary keys.
#[derive(Clone)]
pub struct RepartitionProtocol {
    aggregates: UserAggregateStore,
}

impl RepartitionProtocol {
    pub fn new(aggregates: UserAggregateStore) -> Self {
        Self { aggregates }
    }

    /// Move the aggregate stored under `source_key` to the key derived from
    /// `updated`'s user name with `target_keys`.
    ///
    /// `updated` replaces the entity row's content. When `expected_etag` is
    /// set the move only starts if the stored entity row still carries it.
    /// Returns `Ok(None)` when nothing is stored under `source_key`.
    pub async fn move_aggregate(
        &self,
        source_key: &str,
        expected_etag: Option<&str>,
        updated: &User,
        target_keys: &KeyHelper,
        cancel: &CancellationToken,
    ) -> Result<Option<RepartitionOutcome>> {
        let ctx = self.aggregates.context();
        let users_table = ctx.tables.users.clone();

        // (1) read the whole aggregate under the old key
        let source_rows = query_all(
            ctx.store.as_ref(),
            &users_table,
            &TableQuery::partition(source_key),
            cancel,
        )
        .await?;
        let source = match UserAggregate::from_partition(source_rows.clone())? {
            Some(aggregate) => aggregate,
            None => return Ok(None),
        };
        if let Some(expected) = expected_etag {
            if source.user.etag.as_deref() != Some(expected) {
                return Err(StorageError::PreconditionFailed {
                    partition_key: source_key.to_string(),
                    row_key: source_key.to_string(),
                }
                .into());
            }
        }
        if source.user.id != updated.id {
            return Err(IdentityStoreError::validation(format!(
                "user id {} does not own {}",
                updated.id, source_key
            )));
        }

        // (2) derive the new key
        let target_key = target_keys.user_key(&updated.normalized_user_name)?;
        if target_key == source_key && target_keys.version() == source.key_version {
            return Err(IdentityStoreError::validation(
                "primary key unchanged; nothing to move",
            ));
        }
        if let Some((occupant, _)) = self.aggregates.read_user(&target_key, cancel).await? {
            if occupant.id != updated.id {
                return Err(StorageError::Conflict {
                    partition_key: target_key.clone(),
                    row_key: target_key,
                }
                .into());
            }
            log::info!("Resuming move of user {} into {}", updated.id, target_key);
        }

        let mut target = source.clone();
        target.primary_key = target_key.clone();
        target.key_version = target_keys.version();
        target.user = updated.clone();
        target.user.etag = None;

        // (3) insert under the new key
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let target_rows = target.to_rows(&target_key, target_keys)?;
        let rows_moved = target_rows.len();
        let mut writer = ctx.batch_writer(&users_table);
        for row in target_rows {
            writer.upsert(row);
        }
        let outcomes = writer
            .submit(cancel)
            .await
            .into_result()
            .map_err(|e| IdentityStoreError::from_batch("repartition insert", e))?;
        log::debug!("Inserted {} row(s) under {}", rows_moved, target_key);

        // (4) repoint index rows
        let source_keys = ctx.keys_for(source.key_version);
        let old_entries = expected_entries(&source_keys, &source)?;
        let new_entries = expected_entries(target_keys, &target)?;
        self.aggregates
            .index()
            .upsert_all(&new_entries, cancel)
            .await
            .map_err(|e| restep(e, "repartition index repoint"))?;

        // (5) delete the old rows, entity last and conditional on the ETag read in (1)
        if cancel.is_cancelled() {
            return Err(IdentityStoreError::Cancelled);
        }
        let mut writer = ctx.batch_writer(&users_table);
        let (entity, dependents): (Vec<_>, Vec<_>) =
            source_rows.into_iter().partition(UserRow::is_entity_row);
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
            .map_err(|e| IdentityStoreError::from_batch("repartition delete source", e))?;

        // (6) drop index rows that only existed for the old key
        let stale = stale_entries(&old_entries, &new_entries);
        self.aggregates
            .index()
            .delete_all(&stale, cancel)
            .await
            .map_err(|e| restep(e, "repartition stale index cleanup"))?;

        let mut user = target.user.clone();
        user.etag = outcomes
            .iter()
            .find(|o| o.row_key == target_key)
            .and_then(|o| o.etag.as_ref())
            .map(|e| e.as_str().to_string());

        log::info!(
            "Moved user {} from {} to {} ({} rows, {} index rows, {} stale removed)",
            user.id,
            source_key,
            target_key,
            rows_moved,
            new_entries.len(),
            stale.len()
        );
        Ok(Some(RepartitionOutcome {
            old_primary_key: source_key.to_string(),
            new_primary_key: target_key,
            user,
            rows_moved,
            index_rows_written: new_entries.len(),
            stale_index_rows_removed: stale.len(),
        }))
    }
}

fn restep(err: IdentityStoreError, step: &str) -> IdentityStoreError {
    match err {
        IdentityStoreError::PartialFailure { failures, .. } => IdentityStoreError::partial(step, failures),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IdentityContext;
    use crate::key_helper::KeyVersion;
    use idtable_commons::{Claim, UserLogin};
    use idtable_store::MemoryTableStore;
    use std::sync::Arc;

    async fn setup() -> (Arc<MemoryTableStore>, UserAggregateStore, UserAggregate) {
        let store = Arc::new(MemoryTableStore::new());
        let ctx = IdentityContext::new(store.clone());
        ctx.initialize().await.unwrap();
        let aggregates = UserAggregateStore::new(ctx);
        let keys = KeyHelper::current();
        let mut agg = UserAggregate::new(
            keys.user_key("alice").unwrap(),
            KeyVersion::Current,
            User::new("alice").with_email("a@x.com"),
        );
        agg.claims.push(Claim::new("dept", "sales"));
        agg.logins.push(UserLogin::new("Google", "g-1"));
        agg.roles.push("Admin".into());
        let created = aggregates
            .create_aggregate(&agg, &CancellationToken::new())
            .await
            .unwrap();
        agg.user = created;
        (store, aggregates, agg)
    }

    #[tokio::test]
    async fn test_move_preserves_dependents_and_repoints_indexes() {
        let (store, aggregates, agg) = setup().await;
        let keys = KeyHelper::current();
        let mut renamed = agg.user.clone();
        renamed.set_user_name("alice2");

        let outcome = RepartitionProtocol::new(aggregates.clone())
            .move_aggregate(
                &agg.primary_key,
                agg.user.etag.as_deref(),
                &renamed,
                &keys,
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.new_primary_key, keys.user_key("alice2").unwrap());
        assert_eq!(outcome.stale_index_rows_removed, 4);

        let cancel = CancellationToken::new();
        assert!(aggregates.read_aggregate(&agg.primary_key, &cancel).await.unwrap().is_none());
        let moved = aggregates
            .read_aggregate(&outcome.new_primary_key, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.user.user_name, "alice2");
        assert_eq!(moved.user.id, agg.user.id);
        assert_eq!(moved.claims, agg.claims);
        assert_eq!(moved.logins, agg.logins);
        assert_eq!(moved.roles, agg.roles);

        // Every index row points at the new key
        let rows = store.dump("AspNetIndex");
        assert_eq!(rows.len(), 6);
        assert!(rows
            .iter()
            .all(|r| r.get_str("PrimaryKey") == Some(outcome.new_primary_key.as_str())));
    }

    #[tokio::test]
    async fn test_crash_before_delete_leaves_user_readable_and_retry_completes() {
        let (store, aggregates, agg) = setup().await;
        let keys = KeyHelper::current();
        let mut renamed = agg.user.clone();
        renamed.set_user_name("alice2");
        let protocol = RepartitionProtocol::new(aggregates.clone());

        store.fail_deletes("AspNetUsers");
        let err = protocol
            .move_aggregate(&agg.primary_key, None, &renamed, &keys, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityStoreError::PartialFailure { ref step, .. } if step == "repartition delete source"));

        let cancel = CancellationToken::new();
        let new_key = keys.user_key("alice2").unwrap();
        assert!(aggregates.read_aggregate(&new_key, &cancel).await.unwrap().is_some());
        assert!(aggregates.read_aggregate(&agg.primary_key, &cancel).await.unwrap().is_some());

        store.clear_faults();
        let outcome = protocol
            .move_aggregate(&agg.primary_key, None, &renamed, &keys, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.new_primary_key, new_key);
        assert!(aggregates.read_aggregate(&agg.primary_key, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_onto_other_users_key_conflicts() {
        let (_store, aggregates, agg) = setup().await;
        let keys = KeyHelper::current();
        let bob = UserAggregate::new(keys.user_key("bob").unwrap(), KeyVersion::Current, User::new("bob"));
        aggregates
            .create_aggregate(&bob, &CancellationToken::new())
            .await
            .unwrap();

        let mut renamed = agg.user.clone();
        renamed.set_user_name("BOB");
        let err = RepartitionProtocol::new(aggregates)
            .move_aggregate(&agg.primary_key, None, &renamed, &keys, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityStoreError::Storage(StorageError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_missing_source_is_none() {
        let (_store, aggregates, _agg) = setup().await;
        let outcome = RepartitionProtocol::new(aggregates)
            .move_aggregate(
                "N_missing",
                None,
                &User::new("x"),
                &KeyHelper::current(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.is_none());
    }
}
