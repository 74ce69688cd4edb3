//! Error and result types for identity operations.
//!
//! Two layers:
//! - [`IdentityStoreError`]: returned as `Err` for validation failures,
//!   cancellation and (from read paths) storage failures.
//! - [`IdentityResult`]: returned by mutating identity operations; a store
//!   failure there becomes a typed failure code instead of an `Err`.

use std::fmt;

use idtable_store::{BatchError, StorageError};
use thiserror::Error;

/// Result type for identity store operations.
pub type Result<T> = std::result::Result<T, IdentityStoreError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityStoreError {
    /// Required argument missing or empty; no store call was made
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Stored row does not map to the expected type
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Some writes of a logical step failed; applied writes were left in place
    #[error("Partial failure during {step}: {}", describe(failures))]
    PartialFailure {
        step: String,
        failures: Vec<(String, StorageError)>,
    },
}

fn describe(failures: &[(String, StorageError)]) -> String {
    failures
        .iter()
        .map(|(key, err)| format!("{} ({})", key, err))
        .collect::<Vec<_>>()
        .join(", ")
}

impl IdentityStoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        IdentityStoreError::Validation(msg.into())
    }

    pub fn partial(step: impl Into<String>, failures: Vec<(String, StorageError)>) -> Self {
        IdentityStoreError::PartialFailure {
            step: step.into(),
            failures,
        }
    }

    /// Wrap a failed multi-partition write under `step`.
    pub fn from_batch(step: &str, err: BatchError) -> Self {
        match err {
            BatchError::Partial { failures, .. } => Self::partial(step, failures),
            BatchError::Cancelled { .. } => IdentityStoreError::Cancelled,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            IdentityStoreError::Storage(err) => err.is_conflict(),
            IdentityStoreError::PartialFailure { failures, .. } => {
                failures.iter().any(|(_, err)| err.is_conflict())
            }
            _ => false,
        }
    }
}

impl From<StorageError> for IdentityStoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Cancelled => IdentityStoreError::Cancelled,
            other => IdentityStoreError::Storage(other),
        }
    }
}

/// Failure codes reported in an [`IdentityResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityErrorCode {
    DuplicateUserName,
    DuplicateRoleName,
    ConcurrencyFailure,
    UserNotFound,
    RoleNotFound,
    UserAlreadyInRole,
    UserNotInRole,
    LoginAlreadyAssociated,
    PartialFailure,
    StorageFailure,
}

impl IdentityErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityErrorCode::DuplicateUserName => "DuplicateUserName",
            IdentityErrorCode::DuplicateRoleName => "DuplicateRoleName",
            IdentityErrorCode::ConcurrencyFailure => "ConcurrencyFailure",
            IdentityErrorCode::UserNotFound => "UserNotFound",
            IdentityErrorCode::RoleNotFound => "RoleNotFound",
            IdentityErrorCode::UserAlreadyInRole => "UserAlreadyInRole",
            IdentityErrorCode::UserNotInRole => "UserNotInRole",
            IdentityErrorCode::LoginAlreadyAssociated => "LoginAlreadyAssociated",
            IdentityErrorCode::PartialFailure => "PartialFailure",
            IdentityErrorCode::StorageFailure => "StorageFailure",
        }
    }
}

impl fmt::Display for IdentityErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityError {
    pub code: IdentityErrorCode,
    pub description: String,
}

impl IdentityError {
    pub fn new(code: IdentityErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Outcome of a mutating identity operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityResult {
    errors: Vec<IdentityError>,
}

impl IdentityResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failed(errors: Vec<IdentityError>) -> Self {
        Self { errors }
    }

    pub fn failure(code: IdentityErrorCode, description: impl Into<String>) -> Self {
        Self::failed(vec![IdentityError::new(code, description)])
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[IdentityError] {
        &self.errors
    }

    pub fn has_code(&self, code: IdentityErrorCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }

    /// Map a store-level error to a typed failure.
    ///
    /// Validation and cancellation stay errors; everything else becomes a
    /// failure code.
    pub fn from_error(err: IdentityStoreError) -> Result<Self> {
        match err {
            IdentityStoreError::Validation(_) | IdentityStoreError::Cancelled => Err(err),
            ref e if e.is_conflict() => Ok(Self::failure(
                IdentityErrorCode::ConcurrencyFailure,
                format!("Optimistic concurrency failure, object has been modified: {}", e),
            )),
            IdentityStoreError::PartialFailure { .. } => Ok(Self::failure(
                IdentityErrorCode::PartialFailure,
                err.to_string(),
            )),
            other => Ok(Self::failure(IdentityErrorCode::StorageFailure, other.to_string())),
        }
    }
}

impl fmt::Display for IdentityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.succeeded() {
            return f.write_str("Succeeded");
        }
        let codes: Vec<_> = self.errors.iter().map(|e| e.code.as_str()).collect();
        write!(f, "Failed : {}", codes.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_display() {
        assert_eq!(IdentityResult::success().to_string(), "Succeeded");
        let failed = IdentityResult::failure(IdentityErrorCode::DuplicateUserName, "taken");
        assert_eq!(failed.to_string(), "Failed : DuplicateUserName");
        assert!(failed.has_code(IdentityErrorCode::DuplicateUserName));
        assert!(!failed.succeeded());
    }

    #[test]
    fn test_from_error_classification() {
        let conflict = IdentityStoreError::from(StorageError::PreconditionFailed {
            partition_key: "p".into(),
            row_key: "r".into(),
        });
        let result = IdentityResult::from_error(conflict).unwrap();
        assert!(result.has_code(IdentityErrorCode::ConcurrencyFailure));

        let partial = IdentityStoreError::partial(
            "index",
            vec![("E_1".to_string(), StorageError::Io("x".into()))],
        );
        let result = IdentityResult::from_error(partial).unwrap();
        assert!(result.has_code(IdentityErrorCode::PartialFailure));

        assert!(IdentityResult::from_error(IdentityStoreError::Cancelled).is_err());
        assert!(IdentityResult::from_error(IdentityStoreError::validation("empty")).is_err());
    }

    #[test]
    fn test_storage_cancel_maps_to_cancelled() {
        assert_eq!(
            IdentityStoreError::from(StorageError::Cancelled),
            IdentityStoreError::Cancelled
        );
    }
}
