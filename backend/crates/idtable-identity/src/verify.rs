//! Index verification and repair.
//!
//! Index rows are written outside the aggregate's partition, so a failed
//! write can leave one missing (lookups through it fail closed) or stale
//! (lookups re-verify and skip it). Verification recomputes the expected
//! set from the aggregate and compares it with what the index holds.

use std::collections::BTreeSet;

use idtable_commons::normalize_key;
use tokio_util::sync::CancellationToken;

use crate::aggregate_store::UserAggregateStore;
use crate::context::IdentityContext;
use crate::error::{IdentityStoreError, Result};
use crate::indexes::expected_entries;
use crate::rows::IndexEntry;

/// Result of checking one aggregate's index rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexVerification {
    pub primary_key: String,
    pub expected: usize,
    /// Expected rows that were absent or pointed elsewhere
    pub missing: Vec<IndexEntry>,
    pub repaired: usize,
}

impl IndexVerification {
    pub fn is_consistent(&self) -> bool {
        self.missing.len() == self.repaired
    }
}

#[derive(Clone)]
pub struct IndexVerifier {
    aggregates: UserAggregateStore,
}

impl IndexVerifier {
    pub fn new(ctx: IdentityContext) -> Self {
        Self {
            aggregates: UserAggregateStore::new(ctx),
        }
    }

    /// Check every index row the aggregate under `primary_key` should have;
    /// with `repair`, upsert the missing ones.
    ///
    /// Returns `None` when no aggregate is stored under `primary_key`.
    pub async fn verify_user_indexes(
        &self,
        primary_key: &str,
        repair: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<IndexVerification>> {
        let aggregate = match self.aggregates.read_aggregate(primary_key, cancel).await? {
            Some(aggregate) => aggregate,
            None => return Ok(None),
        };
        let keys = self.aggregates.context().keys_for(aggregate.key_version);
        let expected = expected_entries(&keys, &aggregate)?;

        let mut missing = Vec::new();
        for entry in &expected {
            if cancel.is_cancelled() {
                return Err(IdentityStoreError::Cancelled);
            }
            let stored = self
                .aggregates
                .index()
                .query_exact(&entry.partition_key, &entry.row_key, cancel)
                .await?;
            let current = stored.is_some_and(|s| s.id == entry.id && s.primary_key == entry.primary_key);
            if !current {
                missing.push(entry.clone());
            }
        }

        let mut repaired = 0;
        if repair && !missing.is_empty() {
            self.aggregates.index().upsert_all(&missing, cancel).await?;
            repaired = missing.len();
            log::info!("Repaired {} index row(s) of {}", repaired, primary_key);
        }
        Ok(Some(IndexVerification {
            primary_key: primary_key.to_string(),
            expected: expected.len(),
            missing,
            repaired,
        }))
    }

    /// Verify the aggregate of `user_name`, trying current keys then legacy.
    pub async fn verify_user_by_name(
        &self,
        user_name: &str,
        repair: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<IndexVerification>> {
        if user_name.is_empty() {
            return Err(IdentityStoreError::validation("user name is required"));
        }
        let normalized = normalize_key(user_name);
        let ctx = self.aggregates.context().clone();
        for keys in ctx.lookup_keys() {
            let primary_key = keys.user_key(&normalized)?;
            if let Some((user, version)) = self.aggregates.read_user(&primary_key, cancel).await? {
                if version == keys.version() && user.normalized_user_name == normalized {
                    return self.verify_user_indexes(&primary_key, repair, cancel).await;
                }
            }
        }
        Ok(None)
    }

    /// Entries of one index partition that no current aggregate accounts
    /// for; with `repair`, delete them.
    pub async fn stale_entries_in(
        &self,
        index_partition: &str,
        repair: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexEntry>> {
        let entries = self
            .aggregates
            .index()
            .query_all_by_partition(index_partition, cancel)
            .await?;
        let mut stale = Vec::new();
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(IdentityStoreError::Cancelled);
            }
            let accounted = match self.aggregates.read_aggregate(&entry.primary_key, cancel).await? {
                Some(aggregate) if aggregate.user.id.as_str() == entry.id => {
                    let keys = self.aggregates.context().keys_for(aggregate.key_version);
                    let expected: BTreeSet<_> = expected_entries(&keys, &aggregate)?
                        .into_iter()
                        .map(|e| (e.partition_key, e.row_key))
                        .collect();
                    expected.contains(&(entry.partition_key.clone(), entry.row_key.clone()))
                }
                _ => false,
            };
            if !accounted {
                stale.push(entry);
            }
        }
        if repair && !stale.is_empty() {
            self.aggregates.index().delete_all(&stale, cancel).await?;
            log::info!("Removed {} stale index row(s) from {}", stale.len(), index_partition);
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate_store::UserAggregate;
    use crate::key_helper::{KeyHelper, KeyVersion};
    use idtable_commons::User;
    use idtable_store::{MatchToken, MemoryTableStore};
    use std::sync::Arc;

    async fn setup() -> (Arc<MemoryTableStore>, UserAggregateStore, UserAggregate) {
        let store = Arc::new(MemoryTableStore::new());
        let ctx = IdentityContext::new(store.clone());
        ctx.initialize().await.unwrap();
        let aggregates = UserAggregateStore::new(ctx);
        let keys = KeyHelper::current();
        let agg = UserAggregate::new(
            keys.user_key("alice").unwrap(),
            KeyVersion::Current,
            User::new("alice").with_email("a@x.com"),
        );
        aggregates
            .create_aggregate(&agg, &CancellationToken::new())
            .await
            .unwrap();
        (store, aggregates, agg)
    }

    #[tokio::test]
    async fn test_missing_index_row_is_repaired() {
        let (store, aggregates, agg) = setup().await;
        let cancel = CancellationToken::new();
        let email_key = KeyHelper::current().email_key(Some("a@x.com"));
        aggregates
            .index()
            .delete(&email_key, &agg.primary_key, MatchToken::Any, &cancel)
            .await
            .unwrap();

        let verifier = IndexVerifier::new(aggregates.context().clone());
        let report = verifier
            .verify_user_by_name("alice", false, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.missing.len(), 1);
        assert!(!report.is_consistent());

        let report = verifier
            .verify_user_indexes(&agg.primary_key, true, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_consistent());
        assert_eq!(store.row_count("AspNetIndex"), report.expected);
    }

    #[tokio::test]
    async fn test_stale_entry_detected_and_removed() {
        let (_store, aggregates, agg) = setup().await;
        let cancel = CancellationToken::new();
        let email_key = KeyHelper::current().email_key(Some("a@x.com"));
        let ghost = IndexEntry {
            partition_key: email_key.clone(),
            row_key: "N_ghost".to_string(),
            id: "ghost".to_string(),
            primary_key: "N_ghost".to_string(),
            key_version: KeyVersion::Current,
        };
        aggregates.index().upsert(&ghost, &cancel).await.unwrap();

        let verifier = IndexVerifier::new(aggregates.context().clone());
        let stale = verifier.stale_entries_in(&email_key, true, &cancel).await.unwrap();
        assert_eq!(stale, vec![ghost]);
        let remaining = aggregates
            .index()
            .query_all_by_partition(&email_key, &cancel)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].primary_key, agg.primary_key);
    }
}
