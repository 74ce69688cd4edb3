//! Admin commands against an in-memory store.

use std::sync::Arc;

use idtable_admin::args::{Command, FindUserArgs};
use idtable_admin::commands::execute;
use idtable_commons::User;
use idtable_configs::{IdentityStoreConfig, KeyAlgorithm};
use idtable_identity::{IdentityContext, KeyHelper, UserStore};
use idtable_store::{MemoryTableStore, TableOperation, TableStore};
use tokio_util::sync::CancellationToken;

const INDEX: &str = "AspNetIndex";

async fn setup() -> (Arc<MemoryTableStore>, IdentityContext) {
    let store = Arc::new(MemoryTableStore::new());
    let ctx = IdentityContext::new(store.clone());
    ctx.initialize().await.unwrap();
    (store, ctx)
}

async fn create_user(ctx: &IdentityContext, name: &str, email: &str) -> User {
    let users = UserStore::new(ctx.clone());
    let mut user = User::new(name).with_email(email);
    let result = users.create(&mut user, &CancellationToken::new()).await.unwrap();
    assert!(result.succeeded(), "{}", result);
    user
}

fn find_by(name: Option<&str>, email: Option<&str>) -> Command {
    Command::FindUser(FindUserArgs {
        name: name.map(str::to_string),
        id: None,
        email: email.map(str::to_string),
        login: None,
    })
}

#[tokio::test]
async fn test_find_user_reports_location() {
    let (_store, ctx) = setup().await;
    let user = create_user(&ctx, "alice", "alice@example.com").await;
    let cancel = CancellationToken::new();

    let out = execute(&ctx, &find_by(None, Some("ALICE@example.com")), &cancel)
        .await
        .unwrap();
    assert!(out.contains(user.id.as_str()));
    assert!(out.contains("alice@example.com"));
    let primary_key = ctx.keys.user_key("ALICE").unwrap();
    assert!(out.contains(&primary_key));

    let missing = execute(&ctx, &find_by(Some("nobody"), None), &cancel).await.unwrap();
    assert_eq!(missing, "User not found\n");
}

#[tokio::test]
async fn test_find_user_rejects_malformed_login() {
    let (_store, ctx) = setup().await;
    let command = Command::FindUser(FindUserArgs {
        name: None,
        id: None,
        email: None,
        login: Some("no-separator".to_string()),
    });
    assert!(execute(&ctx, &command, &CancellationToken::new()).await.is_err());
}

#[tokio::test]
async fn test_rename_then_delete() {
    let (store, ctx) = setup().await;
    let user = create_user(&ctx, "bob", "bob@example.com").await;
    let cancel = CancellationToken::new();

    let rename = Command::RenameUser {
        from: "bob".to_string(),
        to: "robert".to_string(),
        resume: false,
    };
    let out = execute(&ctx, &rename, &cancel).await.unwrap();
    assert_eq!(out, "Renamed 'bob' to 'robert'\n");

    let users = UserStore::new(ctx.clone());
    assert!(users.find_by_name("bob", &cancel).await.unwrap().is_none());
    let renamed = users.find_by_name("robert", &cancel).await.unwrap().unwrap();
    assert_eq!(renamed.id, user.id);

    let delete = Command::DeleteUser {
        user_name: "robert".to_string(),
    };
    execute(&ctx, &delete, &cancel).await.unwrap();
    assert!(users.find_by_id(user.id.as_str(), &cancel).await.unwrap().is_none());
    assert_eq!(store.row_count(INDEX), 0);

    // Deleting again is not an error
    let out = execute(&ctx, &delete, &cancel).await.unwrap();
    assert!(out.contains("not found"));
}

#[tokio::test]
async fn test_rename_onto_taken_name_fails() {
    let (_store, ctx) = setup().await;
    create_user(&ctx, "carol", "carol@example.com").await;
    create_user(&ctx, "dave", "dave@example.com").await;

    let rename = Command::RenameUser {
        from: "carol".to_string(),
        to: "dave".to_string(),
        resume: false,
    };
    let err = execute(&ctx, &rename, &CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("DuplicateUserName"));
}

#[tokio::test]
async fn test_repair_indexes_restores_missing_email_row() {
    let (store, ctx) = setup().await;
    create_user(&ctx, "erin", "erin@example.com").await;
    let primary_key = ctx.keys.user_key("ERIN").unwrap();
    let email_key = ctx.keys.email_key(Some("erin@example.com"));
    store
        .execute(INDEX, TableOperation::delete(email_key.clone(), primary_key.clone()))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let users = UserStore::new(ctx.clone());
    assert!(users.find_by_email("erin@example.com", &cancel).await.unwrap().is_none());

    let dry_run = Command::RepairIndexes {
        user_names: vec!["erin".to_string()],
        index_partition: None,
        dry_run: true,
    };
    let out = execute(&ctx, &dry_run, &cancel).await.unwrap();
    assert!(out.contains("1 of"));
    assert!(out.contains("0 repaired"));
    assert!(users.find_by_email("erin@example.com", &cancel).await.unwrap().is_none());

    let repair = Command::RepairIndexes {
        user_names: vec!["erin".to_string()],
        index_partition: None,
        dry_run: false,
    };
    let out = execute(&ctx, &repair, &cancel).await.unwrap();
    assert!(out.contains("1 repaired"));
    assert!(users.find_by_email("erin@example.com", &cancel).await.unwrap().is_some());

    let out = execute(&ctx, &repair, &cancel).await.unwrap();
    assert!(out.contains("index rows ok"));
}

#[tokio::test]
async fn test_repair_indexes_requires_a_target() {
    let (_store, ctx) = setup().await;
    let command = Command::RepairIndexes {
        user_names: Vec::new(),
        index_partition: None,
        dry_run: true,
    };
    assert!(execute(&ctx, &command, &CancellationToken::new()).await.is_err());
}

#[tokio::test]
async fn test_migrate_keys_moves_legacy_user() {
    let store = Arc::new(MemoryTableStore::new());
    let mut legacy_config = IdentityStoreConfig::default();
    legacy_config.keys.algorithm = KeyAlgorithm::Sha1;
    let legacy_ctx = IdentityContext::from_config(store.clone(), &legacy_config);
    legacy_ctx.initialize().await.unwrap();
    let user = create_user(&legacy_ctx, "frank", "frank@example.com").await;

    let ctx = IdentityContext::new(store.clone());
    let cancel = CancellationToken::new();
    let command = Command::MigrateKeys {
        user_names: vec!["frank".to_string(), "ghost".to_string()],
    };
    let out = execute(&ctx, &command, &cancel).await.unwrap();
    assert!(out.contains("frank: migrated"));
    assert!(out.contains("ghost: not found"));
    assert!(out.contains("1 migrated, 0 failed, 2 total"));

    let legacy_pk = KeyHelper::legacy().user_key("FRANK").unwrap();
    assert!(store.partition_rows("AspNetUsers", &legacy_pk).is_empty());
    let current_pk = KeyHelper::current().user_key("FRANK").unwrap();
    let found = execute(&ctx, &find_by(Some("frank"), None), &cancel).await.unwrap();
    assert!(found.contains(&current_pk));
    assert!(found.contains(user.id.as_str()));
}

#[tokio::test]
async fn test_cancelled_command_is_an_error() {
    let (_store, ctx) = setup().await;
    create_user(&ctx, "gina", "gina@example.com").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let delete = Command::DeleteUser {
        user_name: "gina".to_string(),
    };
    assert!(execute(&ctx, &delete, &cancel).await.is_err());
    let users = UserStore::new(ctx.clone());
    assert!(users.find_by_name("gina", &CancellationToken::new()).await.unwrap().is_some());
}
