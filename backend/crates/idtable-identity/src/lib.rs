//! # idtable-identity
//!
//! Identity entities (users, roles, claims, logins, tokens) persisted over a
//! partition/row-key table store that only offers point reads, ordered
//! range scans inside a partition, and single-partition atomic batches.
//!
//! ## Layout
//!
//! ```text
//! UserStore / RoleStore        identity operations, IdentityResult codes
//!     ↓
//! RepartitionProtocol          primary-key moves (rename, key migration)
//! FanoutQueryEngine            index scan → bounded-concurrency aggregate reads
//!     ↓
//! UserAggregateStore           one user = many rows in one partition
//! IndexTable + indexes         alternate key → primary key rows
//!     ↓
//! KeyHelper                    deterministic, versioned key derivation
//! ```
//!
//! Writes that span partitions (aggregate plus index rows) are never atomic.
//! Every step is idempotent, index hits are re-verified against the owning
//! entity row, and a rerun of a partially failed operation completes it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use idtable_commons::User;
//! use idtable_identity::{IdentityContext, UserStore};
//! use idtable_store::MemoryTableStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> idtable_identity::Result<()> {
//! let ctx = IdentityContext::new(Arc::new(MemoryTableStore::new()));
//! ctx.initialize().await?;
//! let users = UserStore::new(ctx);
//!
//! let cancel = CancellationToken::new();
//! let mut alice = User::new("alice").with_email("a@x.com");
//! assert!(users.create(&mut alice, &cancel).await?.succeeded());
//! assert!(users.find_by_email("A@X.COM", &cancel).await?.is_some());
//! # Ok(())
//! # }
//! ```

pub mod aggregate_store;
pub mod context;
pub mod error;
pub mod fanout;
pub mod index_table;
pub mod indexes;
pub mod key_helper;
pub mod migration;
pub mod repartition;
pub mod role_store;
pub mod rows;
pub mod user_store;
pub mod verify;

pub use aggregate_store::{UserAggregate, UserAggregateStore};
pub use context::{IdentityContext, TableNames};
pub use error::{IdentityError, IdentityErrorCode, IdentityResult, IdentityStoreError, Result};
pub use fanout::{FanoutOptions, FanoutQueryEngine};
pub use index_table::{IndexPage, IndexTable};
pub use indexes::{create_user_indexes, expected_entries, stale_entries, UserIndexDefinition};
pub use key_helper::{KeyHash, KeyHelper, KeyKind, KeyVersion, Sha1KeyHash, Sha256KeyHash};
pub use migration::{KeyMigrator, MigrationOutcome, MigrationReport, UserMigration};
pub use repartition::{RepartitionOutcome, RepartitionProtocol};
pub use role_store::{RoleAggregate, RoleStore};
pub use rows::IndexEntry;
pub use user_store::{UserClaimStore, UserLoginStore, UserRoleStore, UserStore, UserTokenStore};
pub use verify::{IndexVerification, IndexVerifier};
