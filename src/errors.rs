//! Unified error type for the reservation engine.
//!
//! Every fallible operation returns [`Result`]. Callers decide what to do with a failure by
//! matching on [`Error::kind`] rather than on individual variants: validation failures go back to
//! the caller, concurrency failures may be retried by batch jobs, and consistency failures stop
//! the current job run.

use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Coarse classification used by callers and the retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A precondition was violated (wrong state, past deadline, insufficient stock...)
    Validation,
    /// A referenced entity does not exist
    NotFound,
    /// Lock contention, unique-key collision, or a conditional update that lost a race
    Concurrency,
    /// An invariant breach that needs operator attention
    Consistency,
    /// Storage, I/O and configuration failures
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Out of stock for product {product_id}: requested {requested}, available {available}")]
    OutOfStock {
        product_id: i64,
        requested: i32,
        available: i32,
    },

    #[error("Insufficient points: balance {balance}, required {required}")]
    InsufficientPoints { balance: i64, required: i64 },

    #[error("Cannot move {entity} from {from} to {to}: requires {required}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
        required: String,
    },

    #[error("Concurrent modification: {message}")]
    Concurrency { message: String },

    #[error("Consistency check failed: {message}")]
    Consistency { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn concurrency(message: impl Into<String>) -> Self {
        Self::Concurrency {
            message: message.into(),
        }
    }

    pub(crate) fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    /// Classifies this error for callers and the retry wrapper.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. }
            | Self::OutOfStock { .. }
            | Self::InsufficientPoints { .. }
            | Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Concurrency { .. } => ErrorKind::Concurrency,
            Self::Consistency { .. } => ErrorKind::Consistency,
            Self::Database(err) => classify_db_error(err),
            Self::Config { .. } | Self::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// True for errors a caller should report back as a 4xx-style rejection.
    /// `NotFound` counts as a validation failure.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::NotFound)
    }

    /// True for transient errors that batch jobs may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }
}

fn classify_db_error(err: &DbErr) -> ErrorKind {
    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
        return ErrorKind::Concurrency;
    }
    let text = err.to_string().to_lowercase();
    let contended = [
        "database is locked",
        "busy",
        "deadlock",
        "lock wait timeout",
        "could not obtain lock",
    ]
    .iter()
    .any(|needle| text.contains(needle));
    if contended {
        ErrorKind::Concurrency
    } else {
        ErrorKind::Infrastructure
    }
}

// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(Error::not_found("Product", 7).kind(), ErrorKind::NotFound);
        assert_eq!(Error::concurrency("x").kind(), ErrorKind::Concurrency);
        assert_eq!(Error::consistency("x").kind(), ErrorKind::Consistency);
        assert!(Error::not_found("Product", 7).is_validation());
        assert!(!Error::consistency("x").is_retryable());
        assert!(Error::concurrency("x").is_retryable());
    }

    #[test]
    fn test_db_errors_classified_by_message() {
        let locked = Error::Database(DbErr::Custom("database is locked".to_string()));
        assert_eq!(locked.kind(), ErrorKind::Concurrency);

        let other = Error::Database(DbErr::Custom("no such table: products".to_string()));
        assert_eq!(other.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn test_out_of_stock_message() {
        let err = Error::OutOfStock {
            product_id: 3,
            requested: 2,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "Out of stock for product 3: requested 2, available 1"
        );
        assert!(err.is_validation());
    }
}
