//! Row and property model.
//!
//! A row is addressed by `(partition_key, row_key)` and carries a flat map of
//! typed properties. Mapping domain types to and from properties is done by
//! explicit per-type code in the identity layer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed scalar property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Property {
    String(String),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Double(f64),
    /// Unix timestamp in milliseconds
    DateTime(i64),
}

impl Property {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Property::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Property::Int64(v) | Property::DateTime(v) => Some(*v),
            Property::Int32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Property::Int32(v) => Some(*v),
            Property::Int64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Property::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Property::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<String> for Property {
    fn from(v: String) -> Self {
        Property::String(v)
    }
}

impl From<&str> for Property {
    fn from(v: &str) -> Self {
        Property::String(v.to_string())
    }
}

impl From<i32> for Property {
    fn from(v: i32) -> Self {
        Property::Int32(v)
    }
}

impl From<i64> for Property {
    fn from(v: i64) -> Self {
        Property::Int64(v)
    }
}

impl From<bool> for Property {
    fn from(v: bool) -> Self {
        Property::Bool(v)
    }
}

impl From<f64> for Property {
    fn from(v: f64) -> Self {
        Property::Double(v)
    }
}

/// Property map, ordered by name.
pub type Properties = BTreeMap<String, Property>;

/// Opaque concurrency token assigned by the store on every write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ETag(String);

impl ETag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh, never-reused token.
    pub fn generate() -> Self {
        Self(format!("W/\"{}\"", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Condition attached to a replace, merge or delete.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchToken {
    /// Wildcard (`*`): applies regardless of the stored ETag
    #[default]
    Any,
    /// Applies only while the stored ETag is unchanged
    ETag(ETag),
}

impl MatchToken {
    /// Builds a token from an optional captured ETag; `None` is the wildcard.
    pub fn from_etag(etag: Option<&str>) -> Self {
        match etag {
            Some(tag) if tag != "*" => MatchToken::ETag(ETag::new(tag)),
            _ => MatchToken::Any,
        }
    }

    pub fn matches(&self, current: &ETag) -> bool {
        match self {
            MatchToken::Any => true,
            MatchToken::ETag(expected) => expected == current,
        }
    }
}

/// A table row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    /// Set by the store on reads; ignored on writes
    pub etag: Option<ETag>,
    /// Last-modified time (Unix ms), set by the store
    pub timestamp: Option<i64>,
    pub properties: Properties,
}

impl TableRow {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            timestamp: None,
            properties: Properties::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, name: &str, value: impl Into<Property>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Property>) {
        self.properties.insert(name.to_string(), value.into());
    }

    /// Sets the property when `value` is `Some`, removes it otherwise.
    pub fn set_opt<V: Into<Property>>(&mut self, name: &str, value: Option<V>) {
        match value {
            Some(v) => self.set(name, v),
            None => {
                self.properties.remove(name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Property::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Property::as_i64)
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.get(name).and_then(Property::as_i32)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Property::as_bool)
    }

    /// Copy of this row keeping only the selected properties.
    ///
    /// Keys, ETag and timestamp are always kept.
    pub fn project(&self, select: Option<&[String]>) -> TableRow {
        match select {
            None => self.clone(),
            Some(columns) => TableRow {
                partition_key: self.partition_key.clone(),
                row_key: self.row_key.clone(),
                etag: self.etag.clone(),
                timestamp: self.timestamp,
                properties: self
                    .properties
                    .iter()
                    .filter(|(name, _)| columns.iter().any(|c| c == *name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            },
        }
    }

    /// Re-key this row, keeping its properties.
    pub fn rekeyed(&self, partition_key: impl Into<String>, row_key: impl Into<String>) -> TableRow {
        TableRow {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            timestamp: None,
            properties: self.properties.clone(),
        }
    }
}

/// What a backend persists for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredRow {
    pub etag: ETag,
    pub timestamp: i64,
    pub properties: Properties,
}

impl StoredRow {
    pub fn new(properties: Properties) -> Self {
        Self {
            etag: ETag::generate(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            properties,
        }
    }

    pub fn to_row(&self, partition_key: &str, row_key: &str) -> TableRow {
        TableRow {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            etag: Some(self.etag.clone()),
            timestamp: Some(self.timestamp),
            properties: self.properties.clone(),
        }
    }
}

/// Characters the table service refuses in keys.
const FORBIDDEN_KEY_CHARS: [char; 4] = ['/', '\\', '#', '?'];

/// Maximum key size in bytes.
pub const MAX_KEY_BYTES: usize = 1024;

/// Validate a partition or row key.
pub fn validate_key(key: &str) -> crate::Result<()> {
    let invalid = |reason: &str| {
        Err(crate::StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        })
    };
    if key.len() > MAX_KEY_BYTES {
        return invalid("key exceeds 1 KiB");
    }
    if let Some(c) = key
        .chars()
        .find(|c| FORBIDDEN_KEY_CHARS.contains(c) || c.is_control())
    {
        return invalid(&format!("forbidden character {:?}", c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_builder_and_getters() {
        let row = TableRow::new("p1", "r1")
            .with("Name", "alice")
            .with("Count", 3_i32)
            .with("Big", 7_i64)
            .with("Flag", true);

        assert_eq!(row.get_str("Name"), Some("alice"));
        assert_eq!(row.get_i32("Count"), Some(3));
        assert_eq!(row.get_i64("Count"), Some(3));
        assert_eq!(row.get_i64("Big"), Some(7));
        assert_eq!(row.get_bool("Flag"), Some(true));
        assert_eq!(row.get_str("Missing"), None);
    }

    #[test]
    fn test_set_opt_removes_on_none() {
        let mut row = TableRow::new("p", "r").with("Email", "a@x.com");
        row.set_opt::<String>("Email", None);
        assert!(row.get("Email").is_none());
    }

    #[test]
    fn test_project_keeps_selected_columns() {
        let row = TableRow::new("p", "r").with("Id", "u1").with("Payload", "big");
        let projected = row.project(Some(&["Id".to_string()]));
        assert_eq!(projected.properties.len(), 1);
        assert_eq!(projected.get_str("Id"), Some("u1"));
        assert_eq!(projected.row_key, "r");
    }

    #[test]
    fn test_match_token() {
        let tag = ETag::new("W/\"1\"");
        assert!(MatchToken::Any.matches(&tag));
        assert!(MatchToken::ETag(tag.clone()).matches(&tag));
        assert!(!MatchToken::ETag(ETag::new("W/\"2\"")).matches(&tag));
        assert_eq!(MatchToken::from_etag(Some("*")), MatchToken::Any);
        assert_eq!(MatchToken::from_etag(None), MatchToken::Any);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("N_abc123").is_ok());
        assert!(validate_key("").is_ok());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("a#b").is_err());
        assert!(validate_key("a\0b").is_err());
        assert!(validate_key(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn test_property_serde_roundtrip_preserves_type() {
        let p = Property::DateTime(1_700_000_000_000);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<Property>(&json).unwrap(), p);
    }
}
