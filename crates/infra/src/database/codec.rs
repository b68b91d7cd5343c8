//! Column encoding shared by the SQLCipher repositories.
//!
//! Timestamps are stored as unix milliseconds and ids as hyphenated UUID
//! text. Decoding failures surface as `FromSqlConversionFailure` so they go
//! through the same error mapping as every other rusqlite error.

use chrono::{DateTime, TimeZone, Utc};
use clinisync_common::storage::{StorageError, StorageResult};
use rusqlite::types::Type;
use rusqlite::Row;
use uuid::Uuid;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn now_millis() -> i64 {
    to_millis(Utc::now())
}

pub(crate) fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {millis} out of range").into(),
        )
    })
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    parse_uuid(idx, &raw)
}

pub(crate) fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| parse_uuid(idx, &value)).transpose()
}

/// Parse a text column with `FromStr`, reporting failures against `idx`.
pub(crate) fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

/// Decode a JSON text column.
pub(crate) fn json_at<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_uuid(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// `QueryReturnedNoRows` becomes `None`.
pub(crate) fn optional<T>(result: StorageResult<T>) -> StorageResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StorageError::Rusqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// `usize` limits are bound as SQLite integers.
pub(crate) fn usize_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub(crate) fn i64_to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip_keeps_millisecond_precision() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let now = Utc::now();
        let decoded = conn
            .query_row("SELECT ?1", [to_millis(now)], |row| millis_at(row, 0))
            .expect("decode");
        assert_eq!(decoded.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn malformed_uuid_is_conversion_failure() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let err = conn.query_row("SELECT 'nope'", [], |row| uuid_at(row, 0)).expect_err("invalid");
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(0, Type::Text, _)));
    }

    #[test]
    fn null_optional_uuid_is_none() {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        let value = conn.query_row("SELECT NULL", [], |row| opt_uuid_at(row, 0)).expect("decode");
        assert!(value.is_none());
    }

    #[test]
    fn negative_counts_clamp_to_zero() {
        assert_eq!(i64_to_u64(-3), 0);
        assert_eq!(i64_to_u32(7), 7);
        assert_eq!(usize_to_i64(5), 5);
    }
}
