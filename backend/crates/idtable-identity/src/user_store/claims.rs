use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use idtable_commons::{Claim, User};
use idtable_store::TableOperation;
use tokio_util::sync::CancellationToken;

use super::{Located, UserStore};
use crate::aggregate_store::UserAggregate;
use crate::error::{IdentityResult, IdentityStoreError, Result};
use crate::indexes::{ClaimIndex, UserIndexDefinition};
use crate::key_helper::KeyKind;
use crate::rows::{ClaimRow, IndexEntry, RowMapping};

/// Claims held by a user.
#[async_trait]
pub trait UserClaimStore {
    async fn get_claims(&self, user: &User, cancel: &CancellationToken) -> Result<Vec<Claim>>;

    /// Adding a claim the user already holds is a no-op.
    async fn add_claims(
        &self,
        user: &User,
        claims: &[Claim],
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    async fn replace_claim(
        &self,
        user: &User,
        claim: &Claim,
        new_claim: &Claim,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    /// Removing a claim the user does not hold is a no-op.
    async fn remove_claims(
        &self,
        user: &User,
        claims: &[Claim],
        cancel: &CancellationToken,
    ) -> Result<IdentityResult>;

    /// Every user currently holding `claim`, resolved through the claim index.
    async fn get_users_for_claim(&self, claim: &Claim, cancel: &CancellationToken) -> Result<Vec<User>>;
}

impl UserStore {
    /// Claim index rows `located` should have for `claims`.
    fn claim_entries(&self, located: &Located, claims: &[Claim]) -> Result<Vec<IndexEntry>> {
        let keys = self.context().keys_for(located.key_version);
        let mut aggregate = UserAggregate::new(
            located.primary_key.clone(),
            located.key_version,
            located.user.clone(),
        );
        aggregate.claims = claims.to_vec();
        ClaimIndex.extract_entries(&keys, &aggregate)
    }

    /// Stored claim rows keyed by row key.
    async fn stored_claims(
        &self,
        located: &Located,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, Claim>> {
        let rows = self
            .aggregates
            .read_dependents(&located.primary_key, KeyKind::Claim, cancel)
            .await?;
        rows.iter()
            .map(|row| Ok((row.row_key.clone(), ClaimRow::read_columns(row)?.claim)))
            .collect()
    }
}

#[async_trait]
impl UserClaimStore for UserStore {
    async fn get_claims(&self, user: &User, cancel: &CancellationToken) -> Result<Vec<Claim>> {
        match self.locate(user, cancel).await? {
            Some(located) => Ok(self.stored_claims(&located, cancel).await?.into_values().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn add_claims(
        &self,
        user: &User,
        claims: &[Claim],
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        validate_claims(claims)?;
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let keys = self.context().keys_for(located.key_version);
        let mut operations = Vec::with_capacity(claims.len());
        for claim in claims {
            let row_key = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
            let row = ClaimRow {
                owner_id: located.user.id.as_str().to_string(),
                claim: claim.clone(),
            };
            operations.push(TableOperation::InsertOrReplace(row.to_row(
                &located.primary_key,
                &row_key,
                located.key_version,
            )));
        }
        let upserts = self.claim_entries(&located, claims)?;
        self.write_dependents(operations, &upserts, &[], "claim add", cancel)
            .await
    }

    async fn replace_claim(
        &self,
        user: &User,
        claim: &Claim,
        new_claim: &Claim,
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        validate_claims(std::slice::from_ref(new_claim))?;
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let keys = self.context().keys_for(located.key_version);
        let old_key = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
        let new_key = keys.claim_key(&new_claim.claim_type, &new_claim.claim_value)?;
        let stored = self.stored_claims(&located, cancel).await?;
        if !stored.contains_key(&old_key) {
            return Ok(IdentityResult::success());
        }

        let row = ClaimRow {
            owner_id: located.user.id.as_str().to_string(),
            claim: new_claim.clone(),
        };
        let mut operations = vec![TableOperation::InsertOrReplace(row.to_row(
            &located.primary_key,
            &new_key,
            located.key_version,
        ))];
        let mut deletes = Vec::new();
        if old_key != new_key {
            operations.push(TableOperation::delete(&located.primary_key, &old_key));
            deletes = self.claim_entries(&located, std::slice::from_ref(claim))?;
        }
        let upserts = self.claim_entries(&located, std::slice::from_ref(new_claim))?;
        self.write_dependents(operations, &upserts, &deletes, "claim replace", cancel)
            .await
    }

    async fn remove_claims(
        &self,
        user: &User,
        claims: &[Claim],
        cancel: &CancellationToken,
    ) -> Result<IdentityResult> {
        let located = match self.locate_or_fail(user, cancel).await? {
            Ok(located) => located,
            Err(failed) => return Ok(failed),
        };
        let keys = self.context().keys_for(located.key_version);
        let stored = self.stored_claims(&located, cancel).await?;

        let mut operations = Vec::new();
        let mut seen = BTreeSet::new();
        for claim in claims {
            let row_key = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
            if stored.contains_key(&row_key) && seen.insert(row_key.clone()) {
                operations.push(TableOperation::delete(&located.primary_key, row_key));
            }
        }
        // Index rows go even when the claim row is already gone
        let deletes = self.claim_entries(&located, claims)?;
        self.write_dependents(operations, &[], &deletes, "claim remove", cancel)
            .await
    }

    async fn get_users_for_claim(&self, claim: &Claim, cancel: &CancellationToken) -> Result<Vec<User>> {
        validate_claims(std::slice::from_ref(claim))?;
        let mut users: BTreeMap<String, User> = BTreeMap::new();
        for keys in self.context().lookup_keys() {
            let partition = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
            let resolved = self
                .fanout
                .resolve(&partition, |aggregate| aggregate.claims.contains(claim), cancel)
                .await?;
            for aggregate in resolved {
                users
                    .entry(aggregate.user.id.as_str().to_string())
                    .or_insert(aggregate.user);
            }
        }
        Ok(users.into_values().collect())
    }
}

fn validate_claims(claims: &[Claim]) -> Result<()> {
    if claims.iter().any(|c| c.claim_type.is_empty()) {
        return Err(IdentityStoreError::validation("claim type is required"));
    }
    Ok(())
}
