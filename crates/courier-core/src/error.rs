//! Error types and result handling for ledger and domain operations.
//!
//! Covers validation failures at the domain boundary (unrecognised status
//! vocabulary, out-of-range status codes, illegal state transitions) and
//! persistence failures from the callback ledger.

use thiserror::Error;

use crate::models::CallbackStatus;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for domain and storage operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Callback status code outside the five-value enum.
    #[error("Invalid callback status code: {code}")]
    InvalidStatus {
        /// The rejected raw status code
        code: i16,
    },

    /// Ledger transition not permitted by the callback state machine.
    #[error("Invalid callback status transition: {from} -> {to}")]
    InvalidTransition {
        /// Status the record was in
        from: CallbackStatus,
        /// Status that was requested
        to: CallbackStatus,
    },
}

impl CoreError {
    /// Returns whether this error was caused by the caller's input rather than
    /// by infrastructure.
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::InvalidStatus { .. } | Self::InvalidTransition { .. }
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
