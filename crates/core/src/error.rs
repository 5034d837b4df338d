//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic validation and invariant failures.
///
/// Ledger-specific failures (conservation, partition, draft scope) live in
/// `LedgerError`, which wraps this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// A quantity outside what the entry allows (negative event, zero movement).
    #[error("invalid quantity {quantity}: {rule}")]
    InvalidQuantity { quantity: i64, rule: &'static str },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid {kind}: {reason}")]
    InvalidId { kind: &'static str, reason: String },

    /// Stale read: the stream or row moved on since it was loaded.
    #[error("version mismatch (expected {expected}, found {actual})")]
    VersionMismatch { expected: u64, actual: u64 },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_quantity(quantity: i64, rule: &'static str) -> Self {
        Self::InvalidQuantity { quantity, rule }
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidId {
            kind,
            reason: reason.into(),
        }
    }
}
