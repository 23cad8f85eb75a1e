//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic data failures (validation, malformed
/// row images). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A key was invalid (e.g. empty or non-scalar).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A row image is missing a required field.
    #[error("missing field: {0}")]
    MissingField(String),

    /// A timestamp field could not be interpreted.
    #[error("invalid timestamp in field '{field}': {reason}")]
    InvalidTimestamp { field: String, reason: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    pub fn invalid_timestamp(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTimestamp {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
