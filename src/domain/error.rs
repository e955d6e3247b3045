//! Ledger error taxonomy

use thiserror::Error;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Errors returned by ledger operations.
///
/// `NotFound` and `Conflict` are the caller's problem and are returned as-is.
/// `Transient` means storage was unavailable and nothing changed; the caller
/// may retry. `InvariantViolation` aborts the operation without applying it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage unavailable: {0}")]
    Transient(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound { entity, id: id.to_string() }
    }

    /// Short machine-readable kind, used in API bodies and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::Transient(_) => "transient",
            LedgerError::InvariantViolation(_) => "invariant_violation",
        }
    }
}
