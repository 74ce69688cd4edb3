//! # idtable-commons
//!
//! Shared types used by every idtable crate.
//!
//! ## Type-Safe Wrappers
//!
//! - `UserId`: stable user identifier (never changes, survives renames)
//! - `RoleId`: stable role identifier
//!
//! ## Models
//!
//! - `User`, `Role`: the two entity kinds persisted as aggregates
//! - `Claim`, `UserLogin`, `UserToken`: dependents co-located with their owner
//!
//! ## Example Usage
//!
//! ```rust
//! use idtable_commons::models::{Claim, User};
//!
//! let user = User::new("alice").with_email("a@x.com");
//! assert_eq!(user.normalized_user_name, "ALICE");
//! assert_eq!(user.normalized_email.as_deref(), Some("A@X.COM"));
//!
//! let claim = Claim::new("department", "sales");
//! assert_eq!(claim.claim_type, "department");
//! ```

pub mod models;
pub mod normalize;

pub use models::{Claim, Role, RoleId, User, UserId, UserLogin, UserToken};
pub use normalize::normalize_key;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
