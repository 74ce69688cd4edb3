//! Identity domain models.
//!
//! These types carry no storage knowledge; the row layout lives with the
//! mappings in `idtable-identity`.

mod claim;
mod login;
mod role;
mod role_id;
mod token;
mod user;
mod user_id;

pub use claim::Claim;
pub use login::UserLogin;
pub use role::Role;
pub use role_id::RoleId;
pub use token::UserToken;
pub use user::User;
pub use user_id::UserId;
