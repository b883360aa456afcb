//! Error types for accountsync

use thiserror::Error;

/// Main error type for account operations
#[derive(Error, Debug)]
pub enum AccountError {
    /// Token or document reference failed structural validation
    #[error("Malformed: {0}")]
    Malformed(String),

    /// A referenced document never resolved
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid for the current account variant
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// External provider authentication or profile fetch failed
    #[error("Link failed: {0}")]
    LinkFailed(String),

    /// Sync endpoint discovery, authentication or parsing failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Automerge document error
    #[error("Automerge error: {0}")]
    Automerge(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<automerge::AutomergeError> for AccountError {
    fn from(err: automerge::AutomergeError) -> Self {
        AccountError::Automerge(err.to_string())
    }
}

impl From<serde_json::Error> for AccountError {
    fn from(err: serde_json::Error) -> Self {
        AccountError::Serialization(err.to_string())
    }
}

/// Result type alias using AccountError
pub type AccountResult<T> = Result<T, AccountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AccountError::NotFound("automerge:abc".to_string());
        assert_eq!(format!("{}", err), "Not found: automerge:abc");

        let err = AccountError::InvalidState("already registered".to_string());
        assert_eq!(format!("{}", err), "Invalid state: already registered");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AccountError = io_err.into();
        assert!(matches!(err, AccountError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: AccountError = json_err.into();
        assert!(matches!(err, AccountError::Serialization(_)));
    }
}
