//! Manifest parsing error types.

use thiserror::Error;

/// Result type alias for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors produced while parsing or extracting manifest fields.
///
/// Every variant names the dotted path it failed on, so callers can surface
/// the exact offending location to the operator.
#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("missing field: {path}")]
    MissingField { path: String },

    #[error("invalid type at {path}: expected {expected}")]
    InvalidType { path: String, expected: &'static str },

    #[error("invalid value at {path}: {reason}")]
    InvalidValue { path: String, reason: String },

    #[error("manifest is not valid yaml: {0}")]
    Yaml(String),
}

impl ManifestError {
    pub fn missing(path: impl Into<String>) -> Self {
        ManifestError::MissingField { path: path.into() }
    }

    pub fn invalid_type(path: impl Into<String>, expected: &'static str) -> Self {
        ManifestError::InvalidType {
            path: path.into(),
            expected,
        }
    }

    pub fn invalid_value(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ManifestError::InvalidValue {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
