//! SQLite pragma management
//!
//! Every pooled connection, ledger or broker, gets the same pragmas once its
//! key has been applied. Consumers on several threads share one file, so WAL
//! and the busy timeout matter more here than raw write speed.

use rusqlite::Connection;

use super::config::SqlCipherPoolConfig;
use crate::storage::error::{StorageError, StorageResult};

/// Apply per-connection pragmas after the key is set.
///
/// - `journal_mode=WAL` lets consumers read while a lease or transition
///   commits.
/// - `wal_autocheckpoint=1000` checkpoints after 1000 pages so the WAL file
///   stays bounded under steady broker traffic.
/// - `synchronous=NORMAL` is durable across application crashes in WAL mode.
/// - `foreign_keys=ON` enforces the schema's references.
/// - The busy timeout makes lock contention wait instead of failing with
///   `SQLITE_BUSY`.
///
/// # Source
/// <https://www.sqlite.org/pragma.html> and <https://www.sqlite.org/wal.html>
pub fn apply_connection_pragmas(
    conn: &Connection,
    config: &SqlCipherPoolConfig,
) -> StorageResult<()> {
    let mut pragma_sql = String::new();

    // Journal mode
    if config.enable_wal {
        pragma_sql.push_str("PRAGMA journal_mode=WAL;\n");
        pragma_sql.push_str("PRAGMA wal_autocheckpoint=1000;\n");
    }

    pragma_sql.push_str("PRAGMA synchronous=NORMAL;\n");

    if config.enable_foreign_keys {
        pragma_sql.push_str("PRAGMA foreign_keys=ON;\n");
    }

    conn.execute_batch(&pragma_sql)
        .map_err(|e| StorageError::Query(format!("Failed to apply pragmas: {e}")))?;

    // Not a batch pragma: takes a duration
    conn.busy_timeout(config.busy_timeout)
        .map_err(|e| StorageError::Query(format!("Failed to set busy timeout: {e}")))?;

    Ok(())
}
