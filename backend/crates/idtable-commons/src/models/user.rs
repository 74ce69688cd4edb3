//! User entity.

use serde::{Deserialize, Serialize};

use super::UserId;
use crate::normalize::{normalize_key, normalize_optional};

/// A user account.
///
/// ## Fields
/// - `id`: stable identifier, assigned once
/// - `user_name` / `normalized_user_name`: login name; the normalized form
///   determines the aggregate's primary key
/// - `email` / `normalized_email`: optional, indexed when present
/// - `lockout_end`: Unix timestamp in milliseconds when lockout expires
/// - `created_at` / `updated_at`: Unix timestamps in milliseconds
/// - `etag`: opaque concurrency token of the stored row (`None` until read
///   back from the store)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub user_name: String,
    pub normalized_user_name: String,
    pub email: Option<String>,
    pub normalized_email: Option<String>,
    pub email_confirmed: bool,
    pub password_hash: Option<String>,
    pub security_stamp: Option<String>,
    pub concurrency_stamp: Option<String>,
    pub phone_number: Option<String>,
    pub phone_number_confirmed: bool,
    pub two_factor_enabled: bool,
    pub lockout_end: Option<i64>,
    pub lockout_enabled: bool,
    pub access_failed_count: i32,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip)]
    pub etag: Option<String>,
}

impl User {
    /// Creates a user with a fresh id and the given user name.
    pub fn new(user_name: impl Into<String>) -> Self {
        let user_name = user_name.into();
        let now = crate::now_millis();
        Self {
            id: UserId::generate(),
            normalized_user_name: normalize_key(&user_name),
            user_name,
            email: None,
            normalized_email: None,
            email_confirmed: false,
            password_hash: None,
            security_stamp: Some(uuid::Uuid::new_v4().to_string()),
            concurrency_stamp: Some(uuid::Uuid::new_v4().to_string()),
            phone_number: None,
            phone_number_confirmed: false,
            two_factor_enabled: false,
            lockout_end: None,
            lockout_enabled: true,
            access_failed_count: 0,
            created_at: now,
            updated_at: now,
            etag: None,
        }
    }

    pub fn with_id(mut self, id: UserId) -> Self {
        self.id = id;
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.set_email(Some(email.into()));
        self
    }

    /// Sets the email and its normalized form together.
    pub fn set_email(&mut self, email: Option<String>) {
        self.normalized_email = normalize_optional(email.as_deref());
        self.email = email.filter(|e| !e.is_empty());
    }

    /// Sets the user name and its normalized form together.
    pub fn set_user_name(&mut self, user_name: impl Into<String>) {
        let user_name = user_name.into();
        self.normalized_user_name = normalize_key(&user_name);
        self.user_name = user_name;
    }

    /// Whether the account is locked at `now_ms`.
    pub fn is_locked_out(&self, now_ms: i64) -> bool {
        self.lockout_enabled && self.lockout_end.is_some_and(|end| end > now_ms)
    }
}
