//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures. Storage and
/// connection failures belong to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The requested resource does not exist (or has been soft-deleted).
    #[error("{0}")]
    NotFound(String),

    /// Malformed input or a value that breaks a field constraint
    /// (non-positive amount, overpayment, empty invoice, ...).
    #[error("{0}")]
    BadRequest(String),

    /// The operation is not allowed in the resource's current state
    /// (paying a paid invoice, cancelling a canceled one, ...).
    #[error("{0}")]
    Conflict(String),

    /// A domain invariant was violated (e.g. a stored record that could never
    /// have been produced by the domain rules).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
