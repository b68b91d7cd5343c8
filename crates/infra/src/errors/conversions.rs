//! Conversions from external infrastructure errors into domain errors.

use clinisync_common::storage::StorageError;
use clinisync_domain::ClinisyncError;
use rusqlite::Error as SqlError;
use tokio::task::JoinError;

/// Error newtype that keeps conversions on the infrastructure side and can be
/// converted back into the domain error.
#[derive(Debug)]
pub struct InfraError(pub ClinisyncError);

impl From<InfraError> for ClinisyncError {
    fn from(value: InfraError) -> Self {
        value.0
    }
}

impl From<ClinisyncError> for InfraError {
    fn from(value: ClinisyncError) -> Self {
        InfraError(value)
    }
}

impl std::fmt::Display for InfraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for InfraError {}

/// Extension trait to make the conversion logic explicit in tests and within
/// this module.
trait IntoClinisyncError {
    fn into_clinisync(self) -> ClinisyncError;
}

/* -------------------------------------------------------------------------- */
/* rusqlite::Error → ClinisyncError */
/* -------------------------------------------------------------------------- */

impl IntoClinisyncError for SqlError {
    fn into_clinisync(self) -> ClinisyncError {
        use rusqlite::ffi::ErrorCode;
        use rusqlite::Error as RE;

        fn looks_like_wrong_key(message: &str) -> bool {
            let lower = message.to_ascii_lowercase();
            lower.contains("not a database") || lower.contains("encrypted")
        }

        match self {
            RE::SqliteFailure(err, maybe_message) => {
                let message = maybe_message.unwrap_or_default();
                match (err.code, err.extended_code) {
                    (ErrorCode::DatabaseBusy, _) => {
                        ClinisyncError::Database("database is busy".into())
                    }
                    (ErrorCode::DatabaseLocked, _) => {
                        ClinisyncError::Database("database is locked".into())
                    }
                    (ErrorCode::ConstraintViolation, 2067) => {
                        ClinisyncError::Database("unique constraint violation".into())
                    }
                    (ErrorCode::ConstraintViolation, 787) => {
                        ClinisyncError::Database("foreign key constraint violation".into())
                    }
                    (_, _) if looks_like_wrong_key(&message) => ClinisyncError::Security(
                        "SQLCipher key rejected or database not encrypted".into(),
                    ),
                    _ => ClinisyncError::Database(format!(
                        "sqlite failure {:?} (code {}): {}",
                        err.code, err.extended_code, message
                    )),
                }
            }
            RE::QueryReturnedNoRows => ClinisyncError::NotFound("no rows returned by query".into()),
            RE::FromSqlConversionFailure(_, _, cause) => {
                ClinisyncError::Database(format!("failed to convert sqlite value: {cause}"))
            }
            RE::InvalidColumnType(_, _, ty) => {
                ClinisyncError::Database(format!("invalid column type: {ty}"))
            }
            RE::Utf8Error(_) => {
                ClinisyncError::Database("invalid UTF-8 returned from sqlite".into())
            }
            RE::InvalidPath(path) => ClinisyncError::Database(format!(
                "invalid database path: {}",
                path.to_string_lossy()
            )),
            other => ClinisyncError::Database(other.to_string()),
        }
    }
}

impl From<SqlError> for InfraError {
    fn from(value: SqlError) -> Self {
        InfraError(value.into_clinisync())
    }
}

/* -------------------------------------------------------------------------- */
/* StorageError → ClinisyncError */
/* -------------------------------------------------------------------------- */

impl IntoClinisyncError for StorageError {
    fn into_clinisync(self) -> ClinisyncError {
        match self {
            StorageError::Rusqlite(sql_err) => sql_err.into_clinisync(),
            StorageError::WrongKeyOrNotEncrypted | StorageError::Encryption(_) => {
                ClinisyncError::Security(self.to_string())
            }
            StorageError::InvalidConfig(_) => ClinisyncError::Config(self.to_string()),
            other => ClinisyncError::Database(other.to_string()),
        }
    }
}

impl From<StorageError> for InfraError {
    fn from(value: StorageError) -> Self {
        InfraError(value.into_clinisync())
    }
}

/// Convert a storage-layer error at a repository boundary.
pub fn map_storage_error(err: StorageError) -> ClinisyncError {
    ClinisyncError::from(InfraError::from(err))
}

/// Convert a raw rusqlite error at a repository boundary.
pub fn map_sql_error(err: SqlError) -> ClinisyncError {
    ClinisyncError::from(InfraError::from(err))
}

/// A blocking database task that never returned.
pub fn map_join_error(err: JoinError) -> ClinisyncError {
    if err.is_cancelled() {
        ClinisyncError::Internal("database task cancelled".into())
    } else {
        ClinisyncError::Internal(format!("database task panic: {err}"))
    }
}

/* -------------------------------------------------------------------------- */
/* Tests */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use rusqlite::ffi::{Error as FfiError, ErrorCode};
    use rusqlite::Error as SqlError;

    use super::*;

    #[test]
    fn sqlite_busy_maps_to_database_error() {
        let err = SqlError::SqliteFailure(
            FfiError { code: ErrorCode::DatabaseBusy, extended_code: 5 },
            Some("database is locked".into()),
        );
        let mapped = map_sql_error(err);
        assert_eq!(mapped, ClinisyncError::Database("database is busy".into()));
        assert!(mapped.is_retryable());
    }

    #[test]
    fn unique_violation_is_database_error() {
        let err = SqlError::SqliteFailure(
            FfiError { code: ErrorCode::ConstraintViolation, extended_code: 2067 },
            Some("UNIQUE constraint failed: patients.subject_id".into()),
        );
        assert_eq!(
            map_sql_error(err),
            ClinisyncError::Database("unique constraint violation".into())
        );
    }

    #[test]
    fn wrong_key_maps_to_security() {
        let err = SqlError::SqliteFailure(
            FfiError { code: ErrorCode::NotADatabase, extended_code: 26 },
            Some("file is not a database".into()),
        );
        assert!(matches!(map_sql_error(err), ClinisyncError::Security(_)));
    }

    #[test]
    fn no_rows_maps_to_not_found() {
        assert!(matches!(map_sql_error(SqlError::QueryReturnedNoRows), ClinisyncError::NotFound(_)));
    }

    #[test]
    fn storage_key_errors_are_security() {
        let mapped = map_storage_error(StorageError::WrongKeyOrNotEncrypted);
        assert!(matches!(mapped, ClinisyncError::Security(_)));
        assert!(!mapped.is_retryable());
    }

    #[test]
    fn storage_timeouts_stay_retryable() {
        let mapped = map_storage_error(StorageError::Timeout(5));
        assert!(matches!(mapped, ClinisyncError::Database(_)));
        assert!(mapped.is_retryable());
    }

    #[tokio::test]
    async fn panicked_task_maps_to_internal() {
        let err = tokio::spawn(async { panic!("boom") }).await.expect_err("task panics");
        assert!(matches!(map_join_error(err), ClinisyncError::Internal(m) if m.contains("panic")));
    }
}
