//! SQLCipher connection pool
//!
//! r2d2 pool whose connection manager applies the key and pragmas to every
//! new connection. The pool is verified once at construction so a wrong key
//! fails fast.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info, instrument, warn};

use super::cipher::{configure_sqlcipher, verify_encryption, SqlCipherConfig};
use super::config::SqlCipherPoolConfig;
use super::connection::SqlCipherConnection;
use super::pragmas::apply_connection_pragmas;
use crate::storage::error::{looks_like_wrong_key, StorageError, StorageResult};

/// SQLCipher connection pool
///
/// Backs both the node ledger and the file broker. Each of those opens its
/// own pool, so the broker's lease traffic never starves ledger writes.
///
/// # Features
/// - Key and pragmas applied on every new connection
/// - Wrong keys reported as [`StorageError::WrongKeyOrNotEncrypted`]
/// - Checkout timeouts reported as [`StorageError::Timeout`]
#[derive(Debug)]
pub struct SqlCipherPool {
    pool: Pool<SqliteConnectionManager>,
    config: SqlCipherPoolConfig,
}

impl SqlCipherPool {
    /// Create a pool over the database at `path`.
    ///
    /// # Process
    /// 1. Reject an empty key
    /// 2. Build the r2d2 pool with the key and pragma init hook
    /// 3. Check out one connection and read `sqlite_master` to prove the key
    ///
    /// # Errors
    /// Returns an error if:
    /// - The key is empty (`InvalidConfig`)
    /// - The key does not open an existing file (`WrongKeyOrNotEncrypted`)
    /// - The file cannot be opened or the pool cannot be built (`Connection`)
    #[instrument(skip(encryption_key), fields(db_path = ?path, pool_size = config.max_size))]
    pub fn new(
        path: &Path,
        encryption_key: String,
        config: SqlCipherPoolConfig,
    ) -> StorageResult<Self> {
        if encryption_key.is_empty() {
            return Err(StorageError::InvalidConfig("encryption key must not be empty".into()));
        }

        let cipher_config = SqlCipherConfig::new(encryption_key);
        let pool_config = config.clone();

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            configure_sqlcipher(conn, &cipher_config)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            apply_connection_pragmas(conn, &pool_config)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_size)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .map_err(|e| classify_pool_error("Failed to create pool", &e))?;

        {
            let conn = pool.get().map_err(|e| classify_pool_error("Failed to get test connection", &e))?;
            verify_encryption(&conn)?;
            debug!("Encryption verified successfully");
        }

        info!(max_connections = config.max_size, "SQLCipher pool created");
        Ok(Self { pool, config })
    }

    /// Check out a keyed connection.
    ///
    /// Waits up to the configured connection timeout when every connection
    /// is busy, then fails with [`StorageError::Timeout`].
    #[instrument(skip(self), fields(pool_size = self.config.max_size))]
    pub fn get_sqlcipher_connection(&self) -> StorageResult<SqlCipherConnection> {
        match self.pool.get() {
            Ok(conn) => Ok(SqlCipherConnection::new(conn)),
            Err(e) => {
                if e.to_string().to_lowercase().contains("timed out") {
                    warn!(timeout = ?self.config.connection_timeout, "Connection timeout");
                    Err(StorageError::Timeout(self.config.connection_timeout.as_secs()))
                } else {
                    warn!(error = %e, "Connection error");
                    Err(StorageError::Connection(format!("Failed to get connection: {e}")))
                }
            }
        }
    }

    pub const fn max_size(&self) -> u32 {
        self.config.max_size
    }

    /// Connections currently open and idle, in that order.
    pub fn state(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

fn classify_pool_error(context: &str, err: &r2d2::Error) -> StorageError {
    warn!(error = %err, "{context}");
    if looks_like_wrong_key(&err.to_string()) {
        StorageError::WrongKeyOrNotEncrypted
    } else {
        StorageError::Connection(format!("{context}: {err}"))
    }
}
