//! Storage primitives for encrypted databases
//!
//! r2d2-pooled SQLCipher connections with per-connection key setup and
//! pragmas. Schema management belongs to the application layer.

pub mod error;
pub mod sqlcipher;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use sqlcipher::{
    apply_connection_pragmas, SqlCipherConnection, SqlCipherPool, SqlCipherPoolConfig,
    SqlCipherStatement,
};
