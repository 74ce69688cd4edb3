//! Role entity.

use serde::{Deserialize, Serialize};

use super::RoleId;
use crate::normalize::normalize_key;

/// A named role users can be members of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub normalized_name: String,
    pub concurrency_stamp: Option<String>,
    #[serde(skip)]
    pub etag: Option<String>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: RoleId::generate(),
            normalized_name: normalize_key(&name),
            name,
            concurrency_stamp: Some(uuid::Uuid::new_v4().to_string()),
            etag: None,
        }
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.normalized_name = normalize_key(&name);
        self.name = name;
    }
}
