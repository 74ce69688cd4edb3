//! Index fan-out through the public identity surface.

mod common;

use std::collections::BTreeSet;

use common::{query_settings, rocks_context, TestIdentity, INDEX};
use idtable_commons::{Claim, Role, User};
use idtable_configs::FanoutStrategy;
use idtable_identity::{
    FanoutOptions, KeyHelper, UserClaimStore, UserRoleStore, UserStore,
};
use tokio_util::sync::CancellationToken;

async fn users_with_claim(env: &TestIdentity, count: usize, claim: &Claim) -> BTreeSet<String> {
    let cancel = CancellationToken::new();
    let mut ids = BTreeSet::new();
    for i in 0..count {
        let user = env.create_user(&format!("user{:03}", i), None).await;
        let result = env
            .users
            .add_claims(&user, std::slice::from_ref(claim), &cancel)
            .await
            .unwrap();
        assert!(result.succeeded());
        ids.insert(user.id.as_str().to_string());
    }
    ids
}

#[tokio::test]
async fn test_101_users_same_claim() {
    let env = TestIdentity::with_query(query_settings(30, 10)).await;
    let claim = Claim::new("tenant", "contoso");
    let expected = users_with_claim(&env, 101, &claim).await;

    let found = env
        .users
        .get_users_for_claim(&claim, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(found.len(), 101);
    let ids: BTreeSet<_> = found.iter().map(|u| u.id.as_str().to_string()).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_result_independent_of_concurrency_and_page_size() {
    let env = TestIdentity::new().await;
    let claim = Claim::new("tenant", "fabrikam");
    let expected = users_with_claim(&env, 40, &claim).await;
    let cancel = CancellationToken::new();

    for (page_size, max_batches, strategy) in [
        (1, 1, FanoutStrategy::PerKey),
        (7, 1, FanoutStrategy::Combined),
        (7, 16, FanoutStrategy::PerKey),
        (100, 16, FanoutStrategy::Combined),
    ] {
        let users = UserStore::new(env.ctx.clone()).with_fanout_options(
            FanoutOptions::default()
                .with_page_size(page_size)
                .with_max_concurrent_batches(max_batches)
                .with_strategy(strategy),
        );
        let found = users.get_users_for_claim(&claim, &cancel).await.unwrap();
        let ids: BTreeSet<_> = found.iter().map(|u| u.id.as_str().to_string()).collect();
        assert_eq!(ids, expected, "page {} batches {}", page_size, max_batches);
    }
}

#[tokio::test]
async fn test_removed_claim_is_not_returned_even_with_stale_index_row() {
    let env = TestIdentity::new().await;
    let cancel = CancellationToken::new();
    let claim = Claim::new("tenant", "contoso");
    users_with_claim(&env, 3, &claim).await;

    // Drop the claim row behind the index's back
    let user = env.users.find_by_name("user001", &cancel).await.unwrap().unwrap();
    env.store.fail_partition(INDEX, &KeyHelper::current().claim_key("tenant", "contoso").unwrap());
    let result = env
        .users
        .remove_claims(&user, std::slice::from_ref(&claim), &cancel)
        .await
        .unwrap();
    assert!(!result.succeeded());
    env.store.clear_faults();

    let found = env.users.get_users_for_claim(&claim, &cancel).await.unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|u| u.id != user.id));
}

#[tokio::test]
async fn test_users_in_role() {
    let env = TestIdentity::with_query(query_settings(4, 2)).await;
    let cancel = CancellationToken::new();
    let mut admin = Role::new("Admin");
    env.roles.create(&mut admin, &cancel).await.unwrap();

    let mut members = BTreeSet::new();
    for i in 0..9 {
        let user = env.create_user(&format!("member{}", i), None).await;
        if i % 3 != 0 {
            env.users.add_to_role(&user, "Admin", &cancel).await.unwrap();
            members.insert(user.id.as_str().to_string());
        }
    }
    let found = env.users.get_users_in_role("ADMIN", &cancel).await.unwrap();
    let ids: BTreeSet<_> = found.iter().map(|u| u.id.as_str().to_string()).collect();
    assert_eq!(ids, members);
}

#[tokio::test]
async fn test_cancelled_query_returns_error() {
    let env = TestIdentity::new().await;
    let claim = Claim::new("tenant", "contoso");
    users_with_claim(&env, 5, &claim).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    env.store.reset_stats();
    assert!(env.users.get_users_for_claim(&claim, &cancel).await.is_err());
    assert_eq!(env.store.query_count(), 0);
}

#[tokio::test]
async fn test_claim_fanout_on_rocksdb() {
    let (_rocks, ctx) = rocks_context().await;
    let users = UserStore::new(ctx).with_fanout_options(
        FanoutOptions::default()
            .with_page_size(5)
            .with_max_concurrent_batches(3),
    );
    let cancel = CancellationToken::new();
    let claim = Claim::new("tenant", "rocks");
    let mut expected = BTreeSet::new();
    for i in 0..12 {
        let mut user = User::new(format!("rocks{}", i));
        assert!(users.create(&mut user, &cancel).await.unwrap().succeeded());
        users
            .add_claims(&user, std::slice::from_ref(&claim), &cancel)
            .await
            .unwrap();
        expected.insert(user.id.as_str().to_string());
    }
    let found = users.get_users_for_claim(&claim, &cancel).await.unwrap();
    let ids: BTreeSet<_> = found.iter().map(|u| u.id.as_str().to_string()).collect();
    assert_eq!(ids, expected);
}
