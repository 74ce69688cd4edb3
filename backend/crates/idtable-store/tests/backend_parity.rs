//! Both backends must agree on paging, ranges, projection and conditional
//! write semantics.

use std::sync::Arc;

use idtable_store::test_utils::{memory_store, TestRocksStore};
use idtable_store::{
    query_all, MatchToken, MemoryTableStore, StorageError, TableOperation, TableQuery, TableRow,
    TableStore,
};
use tokio_util::sync::CancellationToken;

async fn seed(store: &dyn TableStore) {
    for pk in ["N_1", "N_2", "N_3"] {
        let mut ops = vec![TableOperation::InsertOrReplace(
            TableRow::new(pk, pk).with("UserName", pk),
        )];
        for i in 0..4 {
            ops.push(TableOperation::InsertOrReplace(
                TableRow::new(pk, format!("C_{}", i)).with("ClaimType", "t").with("ClaimValue", i),
            ));
            ops.push(TableOperation::InsertOrReplace(
                TableRow::new(pk, format!("L_{}", i)).with("LoginProvider", "p"),
            ));
        }
        store.submit_batch("users", ops).await.unwrap();
    }
}

async fn exercise(store: Arc<dyn TableStore>) {
    seed(store.as_ref()).await;
    let cancel = CancellationToken::new();

    // Range scan returns exactly one row kind
    let claims = query_all(
        store.as_ref(),
        "users",
        &TableQuery::partition("N_2").row_key_range("C_", "D_").take(3),
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(claims.len(), 4);
    assert!(claims.iter().all(|r| r.row_key.starts_with("C_")));

    // OR filter across partitions with projection
    let query = TableQuery::partitions(vec!["N_1", "N_3"])
        .unwrap()
        .row_key_range("N_", "O_")
        .select(&["UserName"]);
    let users = query_all(store.as_ref(), "users", &query, &cancel).await.unwrap();
    let names: Vec<_> = users.iter().filter_map(|r| r.get_str("UserName")).collect();
    assert_eq!(names, vec!["N_1", "N_3"]);
    assert!(users.iter().all(|r| r.properties.len() == 1));

    // Stale ETag is a conflict, missing row is not-found
    let current = store.get("users", "N_1", "N_1", None).await.unwrap().unwrap();
    store
        .execute(
            "users",
            TableOperation::Merge {
                row: TableRow::new("N_1", "N_1").with("Email", "x"),
                match_token: MatchToken::ETag(current.etag.clone().unwrap()),
            },
        )
        .await
        .unwrap();
    let stale = store
        .execute(
            "users",
            TableOperation::Delete {
                partition_key: "N_1".into(),
                row_key: "N_1".into(),
                match_token: MatchToken::ETag(current.etag.unwrap()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(stale, StorageError::PreconditionFailed { .. }));
    let missing = store
        .execute("users", TableOperation::delete("N_9", "N_9"))
        .await
        .unwrap_err();
    assert!(missing.is_not_found());

    // Batches spanning partitions are rejected before touching data
    let err = store
        .submit_batch(
            "users",
            vec![
                TableOperation::delete("N_1", "C_0"),
                TableOperation::delete("N_2", "C_0"),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidBatch(_)));
    assert!(store.get("users", "N_1", "C_0", None).await.unwrap().is_some());
}

#[tokio::test]
async fn test_memory_backend_semantics() {
    let store = memory_store(&["users"]).await.unwrap();
    exercise(store).await;
}

#[tokio::test]
async fn test_memory_backend_small_pages() {
    let store = Arc::new(MemoryTableStore::with_max_page_size(1));
    store.create_table_if_not_exists("users").await.unwrap();
    exercise(store).await;
}

#[tokio::test]
async fn test_rocksdb_backend_semantics() {
    let test_store = TestRocksStore::new(&["users"]).unwrap();
    exercise(test_store.store.clone()).await;
}
