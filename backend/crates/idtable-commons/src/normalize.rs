//! Lookup normalization for names and emails.
//!
//! Alternate-key lookups are case-insensitive: every plain identifier is
//! upper-cased before it is hashed into a key, so `alice`, `Alice` and
//! `ALICE` resolve to the same row.

/// Normalize a user name, role name or email for key derivation.
///
/// # Examples
///
/// ```
/// use idtable_commons::normalize_key;
///
/// assert_eq!(normalize_key("Alice@Example.com"), "ALICE@EXAMPLE.COM");
/// ```
pub fn normalize_key(value: &str) -> String {
    value.to_uppercase()
}

/// Normalize an optional value, mapping empty strings to `None`.
pub fn normalize_optional(value: Option<&str>) -> Option<String> {
    match value {
        Some(v) if !v.is_empty() => Some(normalize_key(v)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_is_case_insensitive() {
        assert_eq!(normalize_key("alice"), normalize_key("ALICE"));
        assert_eq!(normalize_key("aLiCe"), "ALICE");
    }

    #[test]
    fn test_normalize_optional() {
        assert_eq!(normalize_optional(None), None);
        assert_eq!(normalize_optional(Some("")), None);
        assert_eq!(normalize_optional(Some("a@x.com")), Some("A@X.COM".to_string()));
    }
}
