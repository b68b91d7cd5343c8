//! SQLCipher key setup and verification.

use rusqlite::Connection;
use tracing::{debug, error};

use crate::storage::error::{looks_like_wrong_key, StorageError, StorageResult};

/// Encryption parameters applied to every pooled connection.
#[derive(Clone)]
pub struct SqlCipherConfig {
    key: String,
    pub cipher_compatibility: i32,
    pub kdf_iter: i32,
}

impl std::fmt::Debug for SqlCipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlCipherConfig")
            .field("key", &"***")
            .field("cipher_compatibility", &self.cipher_compatibility)
            .field("kdf_iter", &self.kdf_iter)
            .finish()
    }
}

impl SqlCipherConfig {
    pub fn new(key: String) -> Self {
        Self { key, cipher_compatibility: 4, kdf_iter: 256_000 }
    }
}

/// Set the key and cipher parameters. Must run before any other statement.
pub fn configure_sqlcipher(conn: &Connection, config: &SqlCipherConfig) -> StorageResult<()> {
    conn.pragma_update(None, "key", &config.key).map_err(|e| {
        error!(error = %e, "SQLCipher key setup failed");
        if looks_like_wrong_key(&e.to_string()) {
            StorageError::WrongKeyOrNotEncrypted
        } else {
            StorageError::Encryption(format!("Failed to set encryption key: {e}"))
        }
    })?;

    conn.pragma_update(None, "cipher_compatibility", config.cipher_compatibility)
        .map_err(|e| StorageError::Encryption(format!("Failed to set cipher_compatibility: {e}")))?;

    conn.pragma_update(None, "kdf_iter", config.kdf_iter)
        .map_err(|e| StorageError::Encryption(format!("Failed to set kdf_iter: {e}")))?;

    debug!("SQLCipher configuration applied");
    Ok(())
}

/// Touch the schema so a wrong key fails here instead of on first query.
pub fn verify_encryption(conn: &Connection) -> StorageResult<()> {
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
        .map_err(|e| {
            if looks_like_wrong_key(&e.to_string()) {
                StorageError::WrongKeyOrNotEncrypted
            } else {
                StorageError::from(e)
            }
        })
}
