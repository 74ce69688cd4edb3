//! Shared setup for identity integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use idtable_commons::User;
use idtable_configs::QuerySettings;
use idtable_identity::{IdentityContext, RoleStore, UserStore};
use idtable_store::test_utils::TestRocksStore;
use idtable_store::{MemoryTableStore, TableStore};
use tokio_util::sync::CancellationToken;

pub const USERS: &str = "AspNetUsers";
pub const INDEX: &str = "AspNetIndex";
pub const ROLES: &str = "AspNetRoles";

/// Identity stores over one in-memory table store.
pub struct TestIdentity {
    pub store: Arc<MemoryTableStore>,
    pub ctx: IdentityContext,
    pub users: UserStore,
    pub roles: RoleStore,
}

impl TestIdentity {
    pub async fn new() -> Self {
        Self::with_store(Arc::new(MemoryTableStore::new())).await
    }

    pub async fn with_store(store: Arc<MemoryTableStore>) -> Self {
        let ctx = IdentityContext::new(store.clone());
        Self::from_context(store, ctx).await
    }

    pub async fn with_query(query: QuerySettings) -> Self {
        let store = Arc::new(MemoryTableStore::new());
        let ctx = IdentityContext::new(store.clone()).with_query_settings(query);
        Self::from_context(store, ctx).await
    }

    async fn from_context(store: Arc<MemoryTableStore>, ctx: IdentityContext) -> Self {
        ctx.initialize().await.expect("initialize identity tables");
        Self {
            users: UserStore::new(ctx.clone()),
            roles: RoleStore::new(ctx.clone()),
            store,
            ctx,
        }
    }

    /// Create a user, panicking on failure.
    pub async fn create_user(&self, name: &str, email: Option<&str>) -> User {
        let mut user = User::new(name);
        if let Some(email) = email {
            user = user.with_email(email);
        }
        let result = self
            .users
            .create(&mut user, &CancellationToken::new())
            .await
            .expect("create user");
        assert!(result.succeeded(), "create {}: {}", name, result);
        user
    }
}

/// Identity context over a RocksDB store in a temp directory.
pub async fn rocks_context() -> (TestRocksStore, IdentityContext) {
    let rocks = TestRocksStore::new(&[USERS, INDEX, ROLES]).expect("open rocksdb");
    let store: Arc<dyn TableStore> = rocks.store.clone();
    let ctx = IdentityContext::new(store);
    ctx.initialize().await.expect("initialize identity tables");
    (rocks, ctx)
}

pub fn query_settings(page_size: usize, max_concurrent_batches: usize) -> QuerySettings {
    QuerySettings {
        page_size,
        max_concurrent_batches,
        ..QuerySettings::default()
    }
}
