//! Key-format migration.
//!
//! Aggregates written under the legacy hash keep resolving through the
//! lookup fallback, but every read pays an extra miss. [`KeyMigrator`]
//! moves them to current keys with the repartition machinery, one user at a
//! time. A migration interrupted part-way is resumed by running it again.

use std::fmt;

use idtable_commons::normalize_key;
use tokio_util::sync::CancellationToken;

use crate::aggregate_store::UserAggregateStore;
use crate::context::IdentityContext;
use crate::error::{IdentityStoreError, Result};
use crate::key_helper::{KeyHelper, KeyVersion};
use crate::repartition::RepartitionProtocol;

/// What happened to one user.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    Migrated { old_key: String, new_key: String },
    AlreadyCurrent,
    NotFound,
    Failed(IdentityStoreError),
}

impl fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationOutcome::Migrated { old_key, new_key } => {
                write!(f, "migrated {} -> {}", old_key, new_key)
            }
            MigrationOutcome::AlreadyCurrent => f.write_str("already current"),
            MigrationOutcome::NotFound => f.write_str("not found"),
            MigrationOutcome::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserMigration {
    pub user_name: String,
    pub outcome: MigrationOutcome,
}

/// Per-user outcomes of a migration run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub users: Vec<UserMigration>,
}

impl MigrationReport {
    pub fn migrated(&self) -> usize {
        self.count(|o| matches!(o, MigrationOutcome::Migrated { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, MigrationOutcome::Failed(_)))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count<F: Fn(&MigrationOutcome) -> bool>(&self, pred: F) -> usize {
        self.users.iter().filter(|u| pred(&u.outcome)).count()
    }
}

/// Moves legacy-keyed user aggregates to the current key format.
#[derive(Clone)]
pub struct KeyMigrator {
    aggregates: UserAggregateStore,
    repartition: RepartitionProtocol,
    legacy: KeyHelper,
}

impl KeyMigrator {
    pub fn new(ctx: IdentityContext) -> Result<Self> {
        if ctx.keys.version() == KeyVersion::Legacy {
            return Err(IdentityStoreError::validation(
                "configured key algorithm is the legacy one; nothing to migrate to",
            ));
        }
        let aggregates = UserAggregateStore::new(ctx);
        Ok(Self {
            repartition: RepartitionProtocol::new(aggregates.clone()),
            aggregates,
            legacy: KeyHelper::legacy(),
        })
    }

    /// Migrate one user by name.
    pub async fn migrate_user(&self, user_name: &str, cancel: &CancellationToken) -> Result<MigrationOutcome> {
        if user_name.is_empty() {
            return Err(IdentityStoreError::validation("user name is required"));
        }
        let normalized = normalize_key(user_name);
        let current = self.aggregates.context().keys.clone();

        let legacy_key = self.legacy.user_key(&normalized)?;
        if let Some((user, KeyVersion::Legacy)) = self.aggregates.read_user(&legacy_key, cancel).await? {
            if user.normalized_user_name == normalized {
                let outcome = self
                    .repartition
                    .move_aggregate(&legacy_key, None, &user, &current, cancel)
                    .await?;
                return Ok(match outcome {
                    Some(moved) => MigrationOutcome::Migrated {
                        old_key: moved.old_primary_key,
                        new_key: moved.new_primary_key,
                    },
                    None => MigrationOutcome::NotFound,
                });
            }
        }

        let current_key = current.user_key(&normalized)?;
        Ok(match self.aggregates.read_user(&current_key, cancel).await? {
            Some((user, version)) if version == current.version() && user.normalized_user_name == normalized => {
                MigrationOutcome::AlreadyCurrent
            }
            _ => MigrationOutcome::NotFound,
        })
    }

    /// Migrate each user in turn. A failure is recorded and the run goes on;
    /// cancellation stops it.
    pub async fn migrate_users(&self, user_names: &[String], cancel: &CancellationToken) -> Result<MigrationReport> {
        let mut report = MigrationReport::default();
        for (i, user_name) in user_names.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(IdentityStoreError::Cancelled);
            }
            let outcome = match self.migrate_user(user_name, cancel).await {
                Ok(outcome) => outcome,
                Err(IdentityStoreError::Cancelled) => return Err(IdentityStoreError::Cancelled),
                Err(err) => {
                    log::warn!("Key migration of '{}' failed: {}", user_name, err);
                    MigrationOutcome::Failed(err)
                }
            };
            log::info!("[{}/{}] {}: {}", i + 1, user_names.len(), user_name, outcome);
            report.users.push(UserMigration {
                user_name: user_name.clone(),
                outcome,
            });
        }
        log::info!(
            "Key migration finished: {} migrated, {} failed, {} total",
            report.migrated(),
            report.failed(),
            report.users.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate_store::UserAggregate;
    use idtable_commons::{Claim, User};
    use idtable_store::MemoryTableStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_migrate_legacy_user() {
        let store = Arc::new(MemoryTableStore::new());
        let ctx = IdentityContext::new(store.clone());
        ctx.initialize().await.unwrap();
        let aggregates = UserAggregateStore::new(ctx.clone());
        let legacy = KeyHelper::legacy();
        let mut agg = UserAggregate::new(
            legacy.user_key("alice").unwrap(),
            KeyVersion::Legacy,
            User::new("alice").with_email("a@x.com"),
        );
        agg.claims.push(Claim::new("dept", "sales"));
        aggregates
            .create_aggregate(&agg, &CancellationToken::new())
            .await
            .unwrap();

        let migrator = KeyMigrator::new(ctx).unwrap();
        let names = vec!["alice".to_string(), "nobody".to_string()];
        let report = migrator
            .migrate_users(&names, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.migrated(), 1);
        assert_eq!(report.users[1].outcome, MigrationOutcome::NotFound);

        let current_key = KeyHelper::current().user_key("alice").unwrap();
        let moved = aggregates
            .read_aggregate(&current_key, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.key_version, KeyVersion::Current);
        assert_eq!(moved.claims, agg.claims);
        assert!(store.partition_rows("AspNetUsers", &agg.primary_key).is_empty());
        // Every index row now carries the current version
        assert!(store
            .dump("AspNetIndex")
            .iter()
            .all(|row| row.get_i32("KeyVersion") == Some(2)));

        let again = migrator
            .migrate_user("alice", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again, MigrationOutcome::AlreadyCurrent);
    }

    #[test]
    fn test_legacy_configuration_is_rejected() {
        let ctx = IdentityContext::new(Arc::new(MemoryTableStore::new()))
            .with_keys(KeyHelper::legacy(), None);
        assert!(KeyMigrator::new(ctx).is_err());
    }
}
