//! Primary-key moves under failure.

mod common;

use common::{TestIdentity, INDEX, USERS};
use idtable_commons::{Claim, UserLogin};
use idtable_identity::{IdentityErrorCode, KeyHelper, UserClaimStore, UserLoginStore};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_crash_between_insert_and_delete_duplicates_instead_of_losing() {
    let env = TestIdentity::new().await;
    let cancel = CancellationToken::new();
    let mut alice = env.create_user("alice", Some("a@x.com")).await;
    env.users
        .add_claims(&alice, &[Claim::new("dept", "sales")], &cancel)
        .await
        .unwrap();
    env.users
        .add_login(&alice, &UserLogin::new("Google", "g-1"), &cancel)
        .await
        .unwrap();

    let keys = KeyHelper::current();
    let k1 = keys.user_key("alice").unwrap();
    let k2 = keys.user_key("alice2").unwrap();

    env.store.fail_deletes(USERS);
    let mut renamed = alice.clone();
    let result = env
        .users
        .set_user_name(&mut renamed, "alice2", &cancel)
        .await
        .unwrap();
    assert!(result.has_code(IdentityErrorCode::PartialFailure), "{}", result);

    // Both copies exist; the new one is fully readable
    assert_eq!(env.store.partition_rows(USERS, &k1).len(), 3);
    assert_eq!(env.store.partition_rows(USERS, &k2).len(), 3);
    let moved = env.users.find_by_name("alice2", &cancel).await.unwrap().unwrap();
    assert_eq!(moved.id, alice.id);
    let by_id = env.users.find_by_id(alice.id.as_str(), &cancel).await.unwrap().unwrap();
    assert_eq!(by_id.user_name, "alice2");
    assert_eq!(
        env.users.find_by_email("a@x.com", &cancel).await.unwrap().unwrap().id,
        alice.id
    );
    assert_eq!(
        env.users.get_claims(&moved, &cancel).await.unwrap(),
        vec![Claim::new("dept", "sales")]
    );

    // Retry finishes the move
    env.store.clear_faults();
    let result = env
        .users
        .resume_rename(&mut alice, "alice", &cancel)
        .await;
    // `alice` still carries the old name; resume needs the new one
    assert!(result.is_err());

    alice.set_user_name("alice2");
    let result = env.users.resume_rename(&mut alice, "alice", &cancel).await.unwrap();
    assert!(result.succeeded(), "{}", result);
    assert!(env.store.partition_rows(USERS, &k1).is_empty());
    assert!(env.users.find_by_name("alice", &cancel).await.unwrap().is_none());
    assert!(env
        .store
        .dump(INDEX)
        .iter()
        .all(|row| row.get_str("PrimaryKey") == Some(k2.as_str())));

    // Nothing left to resume
    let result = env.users.resume_rename(&mut alice, "alice", &cancel).await.unwrap();
    assert!(result.succeeded());
}

#[tokio::test]
async fn test_failed_insert_leaves_original_untouched() {
    let env = TestIdentity::new().await;
    let cancel = CancellationToken::new();
    let mut alice = env.create_user("alice", Some("a@x.com")).await;
    let k2 = KeyHelper::current().user_key("alice2").unwrap();

    env.store.fail_partition(USERS, &k2);
    let result = env
        .users
        .set_user_name(&mut alice, "alice2", &cancel)
        .await
        .unwrap();
    assert!(result.has_code(IdentityErrorCode::PartialFailure));
    env.store.clear_faults();

    assert!(env.users.find_by_name("alice2", &cancel).await.unwrap().is_none());
    let original = env.users.find_by_name("alice", &cancel).await.unwrap().unwrap();
    assert_eq!(original.user_name, "alice");
    assert_eq!(
        env.users.find_by_email("a@x.com", &cancel).await.unwrap().unwrap().user_name,
        "alice"
    );
}

#[tokio::test]
async fn test_stale_etag_blocks_rename() {
    let env = TestIdentity::new().await;
    let cancel = CancellationToken::new();
    let mut alice = env.create_user("alice", None).await;
    let mut stale = alice.clone();

    alice.phone_number = Some("555".into());
    assert!(env.users.update(&mut alice, &cancel).await.unwrap().succeeded());

    let result = env
        .users
        .set_user_name(&mut stale, "alice2", &cancel)
        .await
        .unwrap();
    assert!(result.has_code(IdentityErrorCode::ConcurrencyFailure));
    assert!(env.users.find_by_name("alice2", &cancel).await.unwrap().is_none());
}
