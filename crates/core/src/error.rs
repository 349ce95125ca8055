//! Errors raised while validating provisioning input.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures of the domain layer.
///
/// Backend and transport failures never show up here; they belong to the
/// infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed tenant input (slug, name, admin email).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An id string did not parse as a UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Stale write against a stored run.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
