//! Index definitions for user aggregates.
//!
//! Each definition derives the index rows one aggregate must have. The full
//! expected set drives creation, repartition, deletion and verification; the
//! difference between the set before and after a change gives the stale rows
//! to remove.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::aggregate_store::UserAggregate;
use crate::error::Result;
use crate::key_helper::{KeyHelper, KeyKind};
use crate::rows::IndexEntry;

/// Derives index rows from a user aggregate.
pub trait UserIndexDefinition: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> KeyKind;

    /// Whether the indexed value lives on the entity row itself (as opposed
    /// to a dependent row).
    fn is_entity_level(&self) -> bool;

    fn extract_entries(&self, keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>>;
}

fn owned_entry(partition_key: String, aggregate: &UserAggregate, keys: &KeyHelper) -> IndexEntry {
    IndexEntry {
        row_key: aggregate.primary_key.clone(),
        partition_key,
        id: aggregate.user.id.as_str().to_string(),
        primary_key: aggregate.primary_key.clone(),
        key_version: keys.version(),
    }
}

/// Username → primary key.
///
/// Key format: `N_{hash}` / `{primary_key}`
pub struct UserNameIndex;

impl UserIndexDefinition for UserNameIndex {
    fn name(&self) -> &'static str {
        "username"
    }

    fn kind(&self) -> KeyKind {
        KeyKind::UserName
    }

    fn is_entity_level(&self) -> bool {
        true
    }

    fn extract_entries(&self, keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
        let pk = keys.user_key(&aggregate.user.normalized_user_name)?;
        Ok(vec![owned_entry(pk, aggregate, keys)])
    }
}

/// Stable id → current primary key. Exact lookup, so row key = partition key.
///
/// Key format: `U_{hash}` / `U_{hash}`
pub struct UserIdIndex;

impl UserIndexDefinition for UserIdIndex {
    fn name(&self) -> &'static str {
        "user_id"
    }

    fn kind(&self) -> KeyKind {
        KeyKind::UserId
    }

    fn is_entity_level(&self) -> bool {
        true
    }

    fn extract_entries(&self, keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
        let key = keys.user_id_key(aggregate.user.id.as_str())?;
        let mut entry = owned_entry(key.clone(), aggregate, keys);
        entry.row_key = key;
        Ok(vec![entry])
    }
}

/// Email → primary key. Absent email is not indexed.
///
/// Key format: `E_{hash}` / `{primary_key}`
pub struct EmailIndex;

impl UserIndexDefinition for EmailIndex {
    fn name(&self) -> &'static str {
        "email"
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Email
    }

    fn is_entity_level(&self) -> bool {
        true
    }

    fn extract_entries(&self, keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
        let key = keys.email_key(aggregate.user.normalized_email.as_deref());
        if key.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![owned_entry(key, aggregate, keys)])
    }
}

/// External login → primary key. Exact lookup by provider + key.
///
/// Key format: `L_{hash}` / `L_{hash}`
pub struct LoginIndex;

impl UserIndexDefinition for LoginIndex {
    fn name(&self) -> &'static str {
        "login"
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Login
    }

    fn is_entity_level(&self) -> bool {
        false
    }

    fn extract_entries(&self, keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
        aggregate
            .logins
            .iter()
            .map(|login| {
                let key = keys.login_key(&login.login_provider, &login.provider_key)?;
                let mut entry = owned_entry(key.clone(), aggregate, keys);
                entry.row_key = key;
                Ok(entry)
            })
            .collect()
    }
}

/// Claim → every owner holding it.
///
/// Key format: `C_{hash}` / `{primary_key}`
pub struct ClaimIndex;

impl UserIndexDefinition for ClaimIndex {
    fn name(&self) -> &'static str {
        "claim"
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Claim
    }

    fn is_entity_level(&self) -> bool {
        false
    }

    fn extract_entries(&self, keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
        aggregate
            .claims
            .iter()
            .map(|claim| {
                let key = keys.claim_key(&claim.claim_type, &claim.claim_value)?;
                Ok(owned_entry(key, aggregate, keys))
            })
            .collect()
    }
}

/// Role → every member.
///
/// Key format: `R_{hash}` / `{primary_key}`
pub struct RoleIndex;

impl UserIndexDefinition for RoleIndex {
    fn name(&self) -> &'static str {
        "role"
    }

    fn kind(&self) -> KeyKind {
        KeyKind::Role
    }

    fn is_entity_level(&self) -> bool {
        false
    }

    fn extract_entries(&self, keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
        aggregate
            .roles
            .iter()
            .map(|role| Ok(owned_entry(keys.role_key(role)?, aggregate, keys)))
            .collect()
    }
}

/// The full set of user index definitions.
pub fn create_user_indexes() -> Vec<Arc<dyn UserIndexDefinition>> {
    vec![
        Arc::new(UserNameIndex),
        Arc::new(UserIdIndex),
        Arc::new(EmailIndex),
        Arc::new(LoginIndex),
        Arc::new(ClaimIndex),
        Arc::new(RoleIndex),
    ]
}

/// Every index row `aggregate` should have, deduplicated.
pub fn expected_entries(keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
    collect(keys, aggregate, |_| true)
}

/// Index rows derived from entity-row attributes only (username, id, email).
pub fn entity_entries(keys: &KeyHelper, aggregate: &UserAggregate) -> Result<Vec<IndexEntry>> {
    collect(keys, aggregate, |def| def.is_entity_level())
}

fn collect<F>(keys: &KeyHelper, aggregate: &UserAggregate, include: F) -> Result<Vec<IndexEntry>>
where
    F: Fn(&dyn UserIndexDefinition) -> bool,
{
    let mut entries = BTreeSet::new();
    for def in create_user_indexes() {
        if include(def.as_ref()) {
            entries.extend(def.extract_entries(keys, aggregate)?);
        }
    }
    Ok(entries.into_iter().collect())
}

/// Entries of `before` whose row is not part of `after`.
pub fn stale_entries(before: &[IndexEntry], after: &[IndexEntry]) -> Vec<IndexEntry> {
    let keep: BTreeSet<(&str, &str)> = after.iter().map(IndexEntry::address).collect();
    before
        .iter()
        .filter(|entry| !keep.contains(&entry.address()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use idtable_commons::{Claim, User, UserLogin};

    fn aggregate(keys: &KeyHelper) -> UserAggregate {
        let user = User::new("alice").with_email("a@x.com");
        let mut aggregate = UserAggregate::new(keys.user_key("alice").unwrap(), keys.version(), user);
        aggregate.claims.push(Claim::new("role", "admin"));
        aggregate.logins.push(UserLogin::new("Google", "12345"));
        aggregate.roles.push("Admin".to_string());
        aggregate
    }

    #[test]
    fn test_expected_entries_cover_every_alternate_key() {
        let keys = KeyHelper::current();
        let agg = aggregate(&keys);
        let entries = expected_entries(&keys, &agg).unwrap();
        let kinds: BTreeSet<_> = entries
            .iter()
            .map(|e| KeyKind::of_key(&e.partition_key).unwrap().prefix())
            .collect();
        assert_eq!(kinds.len(), 6);
        assert!(entries.iter().all(|e| e.primary_key == agg.primary_key));
        assert!(entries.iter().all(|e| e.id == agg.user.id.as_str()));

        let login = entries
            .iter()
            .find(|e| e.partition_key.starts_with("L_"))
            .unwrap();
        assert_eq!(login.row_key, login.partition_key);
        let email = entries
            .iter()
            .find(|e| e.partition_key.starts_with("E_"))
            .unwrap();
        assert_eq!(email.row_key, agg.primary_key);
    }

    #[test]
    fn test_username_index_partition_is_primary_key() {
        let keys = KeyHelper::current();
        let agg = aggregate(&keys);
        let entries = UserNameIndex.extract_entries(&keys, &agg).unwrap();
        assert_eq!(entries[0].partition_key, agg.primary_key);
    }

    #[test]
    fn test_no_email_means_no_email_entry() {
        let keys = KeyHelper::current();
        let mut agg = aggregate(&keys);
        agg.user.set_email(None);
        assert!(EmailIndex.extract_entries(&keys, &agg).unwrap().is_empty());
        assert_eq!(entity_entries(&keys, &agg).unwrap().len(), 2);
    }

    #[test]
    fn test_stale_entries_after_email_change() {
        let keys = KeyHelper::current();
        let agg = aggregate(&keys);
        let before = entity_entries(&keys, &agg).unwrap();
        let mut changed = agg.clone();
        changed.user.set_email(Some("b@x.com".to_string()));
        let after = entity_entries(&keys, &changed).unwrap();

        let stale = stale_entries(&before, &after);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].partition_key, keys.email_key(Some("a@x.com")));
    }
}
