use serde::{Deserialize, Serialize};

/// An external login (provider + provider key) linked to a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserLogin {
    pub login_provider: String,
    pub provider_key: String,
    pub provider_display_name: Option<String>,
}

impl UserLogin {
    pub fn new(login_provider: impl Into<String>, provider_key: impl Into<String>) -> Self {
        Self {
            login_provider: login_provider.into(),
            provider_key: provider_key.into(),
            provider_display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.provider_display_name = Some(display_name.into());
        self
    }
}
