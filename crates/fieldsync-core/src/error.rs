//! Error types for fieldsync-core

use thiserror::Error;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or structurally invalid inbound data. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// SQLite failure inside a statement or transaction
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Connection-level database problem (open, lock, pragma)
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller's role does not permit the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether the caller may safely retry the whole operation.
    ///
    /// Reconciliation is idempotent under last-write-wins, so any storage
    /// failure is retryable; validation failures will fail the same way again.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Database(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_transient() {
        let err = Error::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.is_transient());
        assert!(Error::Database("locked".into()).is_transient());
    }

    #[test]
    fn validation_errors_are_not_transient() {
        let err = Error::validation("bad timestamp");
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Validation error: bad timestamp");
    }
}
