use serde::{Deserialize, Serialize};

/// An authentication token stored for a user, keyed by (provider, name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserToken {
    pub login_provider: String,
    pub name: String,
    pub value: Option<String>,
}

impl UserToken {
    pub fn new(
        login_provider: impl Into<String>,
        name: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            login_provider: login_provider.into(),
            name: name.into(),
            value,
        }
    }
}
