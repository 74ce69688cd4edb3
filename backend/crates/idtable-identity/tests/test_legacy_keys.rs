//! Datasets written under the legacy hash.

mod common;

use std::sync::Arc;

use common::{TestIdentity, INDEX, USERS};
use idtable_commons::{Claim, User, UserLogin};
use idtable_configs::{IdentityStoreConfig, KeyAlgorithm};
use idtable_identity::{
    IdentityContext, KeyHelper, KeyMigrator, KeyVersion, MigrationOutcome, UserAggregate,
    UserClaimStore, UserLoginStore, UserStore,
};
use idtable_store::MemoryTableStore;
use tokio_util::sync::CancellationToken;

/// Write `name` the way a legacy deployment would have.
async fn seed_legacy_user(store: Arc<MemoryTableStore>, name: &str, email: &str) -> User {
    let mut config = IdentityStoreConfig::default();
    config.keys.algorithm = KeyAlgorithm::Sha1;
    let ctx = IdentityContext::from_config(store, &config);
    ctx.initialize().await.unwrap();
    let users = UserStore::new(ctx);
    let mut user = User::new(name).with_email(email);
    assert!(users
        .create(&mut user, &CancellationToken::new())
        .await
        .unwrap()
        .succeeded());
    users
        .add_claims(&user, &[Claim::new("dept", "ops")], &CancellationToken::new())
        .await
        .unwrap();
    user
}

#[tokio::test]
async fn test_lookups_fall_back_to_legacy_keys() {
    let store = Arc::new(MemoryTableStore::new());
    let legacy_user = seed_legacy_user(store.clone(), "alice", "a@x.com").await;
    let env = TestIdentity::with_store(store).await;
    let cancel = CancellationToken::new();

    let by_name = env.users.find_by_name("alice", &cancel).await.unwrap().unwrap();
    assert_eq!(by_name.id, legacy_user.id);
    let by_id = env.users.find_by_id(legacy_user.id.as_str(), &cancel).await.unwrap().unwrap();
    assert_eq!(by_id.id, legacy_user.id);
    let by_email = env.users.find_by_email("a@x.com", &cancel).await.unwrap().unwrap();
    assert_eq!(by_email.id, legacy_user.id);
    let by_claim = env
        .users
        .get_users_for_claim(&Claim::new("dept", "ops"), &cancel)
        .await
        .unwrap();
    assert_eq!(by_claim.len(), 1);

    // Dependents added later keep the aggregate's own key format
    env.users
        .add_login(&by_name, &UserLogin::new("Google", "g-1"), &cancel)
        .await
        .unwrap();
    let legacy_pk = KeyHelper::legacy().user_key("alice").unwrap();
    let login_key = KeyHelper::legacy().login_key("Google", "g-1").unwrap();
    assert!(env
        .store
        .partition_rows(USERS, &legacy_pk)
        .iter()
        .any(|row| row.row_key == login_key));
    assert!(env.users.find_by_login("Google", "g-1", &cancel).await.unwrap().is_some());
}

#[tokio::test]
async fn test_new_user_cannot_shadow_legacy_name() {
    let store = Arc::new(MemoryTableStore::new());
    seed_legacy_user(store.clone(), "alice", "a@x.com").await;
    let env = TestIdentity::with_store(store).await;

    let mut shadow = User::new("ALICE");
    let result = env
        .users
        .create(&mut shadow, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.has_code(idtable_identity::IdentityErrorCode::DuplicateUserName));
}

#[tokio::test]
async fn test_fallback_disabled_misses_legacy_rows() {
    let store = Arc::new(MemoryTableStore::new());
    seed_legacy_user(store.clone(), "alice", "a@x.com").await;
    let mut config = IdentityStoreConfig::default();
    config.keys.legacy_fallback = false;
    let users = UserStore::new(IdentityContext::from_config(store, &config));

    assert!(users.find_by_name("alice", &CancellationToken::new()).await.unwrap().is_none());
    assert!(users
        .find_by_email("a@x.com", &CancellationToken::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_migration_moves_user_to_current_keys() {
    let store = Arc::new(MemoryTableStore::new());
    let legacy_user = seed_legacy_user(store.clone(), "alice", "a@x.com").await;
    let env = TestIdentity::with_store(store).await;
    let cancel = CancellationToken::new();

    let migrator = KeyMigrator::new(env.ctx.clone()).unwrap();
    let report = migrator
        .migrate_users(&["alice".to_string(), "bob".to_string()], &cancel)
        .await
        .unwrap();
    assert_eq!(report.migrated(), 1);
    assert!(report.is_success());
    assert_eq!(report.users[1].outcome, MigrationOutcome::NotFound);

    let current_pk = KeyHelper::current().user_key("alice").unwrap();
    let aggregate: UserAggregate = env
        .users
        .aggregates()
        .read_aggregate(&current_pk, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.key_version, KeyVersion::Current);
    assert_eq!(aggregate.user.id, legacy_user.id);
    assert_eq!(aggregate.claims, vec![Claim::new("dept", "ops")]);

    let legacy_pk = KeyHelper::legacy().user_key("alice").unwrap();
    assert!(env.store.partition_rows(USERS, &legacy_pk).is_empty());
    assert!(env
        .store
        .dump(INDEX)
        .iter()
        .all(|row| row.get_i32("KeyVersion") == Some(KeyVersion::Current.as_i32())));

    // Lookups now resolve without the legacy path
    let mut config = IdentityStoreConfig::default();
    config.keys.legacy_fallback = false;
    let strict = UserStore::new(IdentityContext::from_config(env.store.clone(), &config));
    assert!(strict.find_by_email("a@x.com", &cancel).await.unwrap().is_some());
    assert!(strict.find_by_id(legacy_user.id.as_str(), &cancel).await.unwrap().is_some());
}
