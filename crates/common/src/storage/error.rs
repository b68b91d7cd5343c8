//! Storage error types

use thiserror::Error;

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database query error: {0}")]
    Query(String),

    #[error("Database encryption error: {0}")]
    Encryption(String),

    #[error("Wrong encryption key or database not encrypted")]
    WrongKeyOrNotEncrypted,

    #[error("Connection timeout after {0}s")]
    Timeout(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    R2d2(#[from] r2d2::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Busy/locked databases and pool starvation clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::R2d2(_) => true,
            Self::Rusqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// Key problems cannot be fixed by retrying.
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::Encryption(_) | Self::WrongKeyOrNotEncrypted)
    }
}

/// Heuristic shared by pool creation and key setup.
pub(crate) fn looks_like_wrong_key(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("file is not a database")
        || lower.contains("file is encrypted")
        || lower.contains("database disk image is malformed")
        || lower.contains("notadb")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable() {
        assert!(StorageError::Timeout(5).is_retryable());
        assert!(!StorageError::Query("syntax".into()).is_retryable());
    }

    #[test]
    fn key_errors_are_critical() {
        assert!(StorageError::WrongKeyOrNotEncrypted.is_critical());
        assert!(!StorageError::Timeout(1).is_critical());
    }

    #[test]
    fn wrong_key_detection() {
        assert!(looks_like_wrong_key("file is not a database"));
        assert!(!looks_like_wrong_key("no such table: foo"));
    }
}
