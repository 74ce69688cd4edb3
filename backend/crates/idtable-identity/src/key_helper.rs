//! Deterministic key derivation.
//!
//! Plain identifiers (user names, emails, login provider keys, claims, role
//! names) are hashed into fixed-width keys behind a one-letter prefix. The
//! prefix scheme is part of the on-disk contract:
//!
//! | Kind | Prefix | Range upper bound |
//! |------|--------|-------------------|
//! | claim | `C_` | `D_` |
//! | email | `E_` | `F_` |
//! | login | `L_` | `M_` |
//! | user-by-name | `N_` | `O_` |
//! | role | `R_` | `S_` |
//! | token | `T_` | `U_` |
//! | user-by-id | `U_` | `V_` |
//!
//! Each upper bound is the lexicographic successor of its prefix, so the
//! half-open scan `[prefix, upper)` inside a partition returns exactly the
//! rows of one kind.
//!
//! The hash is a strategy selected at construction: SHA-1 (legacy, key
//! version 1) or SHA-256 (key version 2), both over the UTF-16LE bytes of the
//! input and rendered as lowercase hex. The legacy output must stay
//! byte-for-byte stable so previously written keys keep resolving.

use std::fmt;
use std::sync::Arc;

use idtable_commons::normalize_key;
use idtable_configs::KeyAlgorithm;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{IdentityStoreError, Result};

/// Version tag stamped onto rows written under a given hash scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyVersion {
    /// SHA-1 keys
    Legacy = 1,
    /// SHA-256 keys
    Current = 2,
}

impl KeyVersion {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(KeyVersion::Legacy),
            2 => Some(KeyVersion::Current),
            _ => None,
        }
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Hash strategy used by [`KeyHelper`].
pub trait KeyHash: Send + Sync + fmt::Debug {
    fn version(&self) -> KeyVersion;

    /// Lowercase hex digest of `input`.
    fn hash(&self, input: &str) -> String;
}

fn utf16_le_bytes(input: &str) -> Vec<u8> {
    input.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// SHA-1 over UTF-16LE. Legacy format, 40 hex characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1KeyHash;

impl KeyHash for Sha1KeyHash {
    fn version(&self) -> KeyVersion {
        KeyVersion::Legacy
    }

    fn hash(&self, input: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(utf16_le_bytes(input));
        hex::encode(hasher.finalize())
    }
}

/// SHA-256 over UTF-16LE, 64 hex characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256KeyHash;

impl KeyHash for Sha256KeyHash {
    fn version(&self) -> KeyVersion {
        KeyVersion::Current
    }

    fn hash(&self, input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(utf16_le_bytes(input));
        hex::encode(hasher.finalize())
    }
}

/// Kinds of derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Claim,
    Email,
    Login,
    UserName,
    Role,
    Token,
    UserId,
}

impl KeyKind {
    pub const ALL: [KeyKind; 7] = [
        KeyKind::Claim,
        KeyKind::Email,
        KeyKind::Login,
        KeyKind::UserName,
        KeyKind::Role,
        KeyKind::Token,
        KeyKind::UserId,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            KeyKind::Claim => "C_",
            KeyKind::Email => "E_",
            KeyKind::Login => "L_",
            KeyKind::UserName => "N_",
            KeyKind::Role => "R_",
            KeyKind::Token => "T_",
            KeyKind::UserId => "U_",
        }
    }

    /// Exclusive upper bound for a range scan over this kind.
    pub fn upper_bound(self) -> &'static str {
        match self {
            KeyKind::Claim => "D_",
            KeyKind::Email => "F_",
            KeyKind::Login => "M_",
            KeyKind::UserName => "O_",
            KeyKind::Role => "S_",
            KeyKind::Token => "U_",
            KeyKind::UserId => "V_",
        }
    }

    /// Classify a key by its prefix.
    pub fn of_key(key: &str) -> Option<KeyKind> {
        Self::ALL.into_iter().find(|kind| key.starts_with(kind.prefix()))
    }
}

/// Derives partition and row keys from plain identifiers.
#[derive(Debug, Clone)]
pub struct KeyHelper {
    hasher: Arc<dyn KeyHash>,
}

impl KeyHelper {
    pub fn new(algorithm: KeyAlgorithm) -> Self {
        match algorithm {
            KeyAlgorithm::Sha1 => Self::legacy(),
            KeyAlgorithm::Sha256 => Self::current(),
        }
    }

    pub fn from_hasher(hasher: Arc<dyn KeyHash>) -> Self {
        Self { hasher }
    }

    pub fn legacy() -> Self {
        Self::from_hasher(Arc::new(Sha1KeyHash))
    }

    pub fn current() -> Self {
        Self::from_hasher(Arc::new(Sha256KeyHash))
    }

    pub fn version(&self) -> KeyVersion {
        self.hasher.version()
    }

    /// `prefix + hash(plain)` for `kind`. `plain` is hashed as given.
    pub fn derive(&self, kind: KeyKind, plain: &str) -> String {
        format!("{}{}", kind.prefix(), self.hasher.hash(plain))
    }

    /// `[lower, upper)` bounds scanning exactly the rows of `kind`.
    pub fn range(kind: KeyKind) -> (&'static str, &'static str) {
        (kind.prefix(), kind.upper_bound())
    }

    /// Aggregate primary key (partition key = entity row key) of a user.
    pub fn user_key(&self, user_name: &str) -> Result<String> {
        let name = required("user name", user_name)?;
        Ok(self.derive(KeyKind::UserName, &normalize_key(name)))
    }

    /// Id index key for a stable user id.
    pub fn user_id_key(&self, user_id: &str) -> Result<String> {
        let id = required("user id", user_id)?;
        Ok(self.derive(KeyKind::UserId, id))
    }

    /// Id index key for a stable role id (stored in the roles table).
    pub fn role_id_key(&self, role_id: &str) -> Result<String> {
        let id = required("role id", role_id)?;
        Ok(self.derive(KeyKind::UserId, id))
    }

    /// Email index key. An absent or empty email derives the empty key,
    /// which is never written.
    pub fn email_key(&self, email: Option<&str>) -> String {
        match email.map(str::trim) {
            Some(email) if !email.is_empty() => {
                self.derive(KeyKind::Email, &normalize_key(email))
            }
            _ => String::new(),
        }
    }

    /// Login key from `"{provider}_{key}"`.
    pub fn login_key(&self, login_provider: &str, provider_key: &str) -> Result<String> {
        let provider = required("login provider", login_provider)?;
        let key = required("provider key", provider_key)?;
        Ok(self.derive(KeyKind::Login, &format!("{}_{}", provider, key)))
    }

    /// Claim key from `"{type}_{value}"`. The value may be empty.
    pub fn claim_key(&self, claim_type: &str, claim_value: &str) -> Result<String> {
        let claim_type = required("claim type", claim_type)?;
        Ok(self.derive(KeyKind::Claim, &format!("{}_{}", claim_type, claim_value)))
    }

    /// Role key from the normalized role name.
    pub fn role_key(&self, role_name: &str) -> Result<String> {
        let name = required("role name", role_name)?;
        Ok(self.derive(KeyKind::Role, &normalize_key(name)))
    }

    /// Token key from `"{provider}_{name}"`.
    pub fn token_key(&self, login_provider: &str, name: &str) -> Result<String> {
        let provider = required("login provider", login_provider)?;
        let name = required("token name", name)?;
        Ok(self.derive(KeyKind::Token, &format!("{}_{}", provider, name)))
    }
}

fn required<'a>(what: &str, value: &'a str) -> Result<&'a str> {
    if value.trim().is_empty() {
        Err(IdentityStoreError::validation(format!("{} must not be empty", what)))
    } else {
        Ok(value)
    }
}
