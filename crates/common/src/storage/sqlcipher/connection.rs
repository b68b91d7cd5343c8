//! SQLCipher connection wrapper

use std::ops::{Deref, DerefMut};

use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{
    Connection as RusqliteConnection, Row, Statement as RusqliteStatement, ToSql, Transaction,
    TransactionBehavior,
};
use tracing::instrument;

use crate::storage::error::{StorageError, StorageResult};

/// Pooled connection with `StorageError`-returning helpers.
///
/// Derefs to [`rusqlite::Connection`] for anything not wrapped here.
pub struct SqlCipherConnection {
    inner: PooledConnection<SqliteConnectionManager>,
}

impl SqlCipherConnection {
    pub fn new(conn: PooledConnection<SqliteConnectionManager>) -> Self {
        Self { inner: conn }
    }

    #[instrument(skip(self, params), fields(sql = %sql))]
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> StorageResult<usize> {
        self.inner.execute(sql, params).map_err(StorageError::from)
    }

    #[instrument(skip(self, params, f), fields(sql = %sql))]
    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> StorageResult<T>
    where
        F: FnOnce(&Row<'_>) -> Result<T, rusqlite::Error>,
    {
        self.inner.query_row(sql, params, f).map_err(StorageError::from)
    }

    #[instrument(skip(self), fields(sql = %sql))]
    pub fn prepare(&self, sql: &str) -> StorageResult<SqlCipherStatement<'_>> {
        let stmt = self.inner.prepare(sql).map_err(StorageError::from)?;
        Ok(SqlCipherStatement::new(stmt))
    }

    /// Deferred transaction.
    #[instrument(skip(self))]
    pub fn transaction(&mut self) -> StorageResult<Transaction<'_>> {
        self.inner.transaction().map_err(StorageError::from)
    }

    /// Transaction that takes the write lock up front, so read-then-write
    /// sequences cannot interleave with another writer.
    #[instrument(skip(self))]
    pub fn immediate_transaction(&mut self) -> StorageResult<Transaction<'_>> {
        self.inner
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StorageError::from)
    }
}

impl Deref for SqlCipherConnection {
    type Target = RusqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for SqlCipherConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Prepared statement whose `query_map` collects into a `Vec`.
pub struct SqlCipherStatement<'conn> {
    inner: RusqliteStatement<'conn>,
}

impl<'conn> SqlCipherStatement<'conn> {
    pub fn new(stmt: RusqliteStatement<'conn>) -> Self {
        Self { inner: stmt }
    }

    pub fn execute(&mut self, params: &[&dyn ToSql]) -> StorageResult<usize> {
        self.inner.execute(params).map_err(StorageError::from)
    }

    pub fn query_map<T, F>(&mut self, params: &[&dyn ToSql], mut f: F) -> StorageResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> Result<T, rusqlite::Error>,
    {
        let rows = self.inner.query_map(params, |row| f(row)).map_err(StorageError::from)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::storage::sqlcipher::{SqlCipherPool, SqlCipherPoolConfig};

    fn test_key() -> String {
        "test_key_64_chars_long_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()
    }

    #[test]
    fn execute_and_query_row() {
        let temp_dir = TempDir::new().unwrap();
        let pool = SqlCipherPool::new(
            &temp_dir.path().join("conn.db"),
            test_key(),
            SqlCipherPoolConfig::default(),
        )
        .unwrap();
        let conn = pool.get_sqlcipher_connection().unwrap();

        conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT)", &[]).unwrap();
        let name = "Bob";
        assert_eq!(conn.execute("INSERT INTO test (name) VALUES (?)", &[&name]).unwrap(), 1);

        let fetched: String =
            conn.query_row("SELECT name FROM test WHERE id = ?", &[&1], |row| row.get(0)).unwrap();
        assert_eq!(fetched, "Bob");
    }

    #[test]
    fn query_map_collects_rows() {
        let temp_dir = TempDir::new().unwrap();
        let pool = SqlCipherPool::new(
            &temp_dir.path().join("conn.db"),
            test_key(),
            SqlCipherPoolConfig::default(),
        )
        .unwrap();
        let conn = pool.get_sqlcipher_connection().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1), (2), (3);")
            .unwrap();

        let mut stmt = conn.prepare("SELECT v FROM t WHERE v >= ?1 ORDER BY v").unwrap();
        let values: Vec<i64> = stmt.query_map(&[&2], |row| row.get(0)).unwrap();
        assert_eq!(values, vec![2, 3]);
    }

    #[test]
    fn immediate_transaction_rolls_back_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let pool = SqlCipherPool::new(
            &temp_dir.path().join("conn.db"),
            test_key(),
            SqlCipherPoolConfig::default(),
        )
        .unwrap();
        let mut conn = pool.get_sqlcipher_connection().unwrap();
        conn.execute("CREATE TABLE t (v INTEGER)", &[]).unwrap();

        {
            let tx = conn.immediate_transaction().unwrap();
            tx.execute("INSERT INTO t VALUES (1)", []).unwrap();
        }

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", &[], |row| row.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
