//! SQLCipher-backed pending-sync ledger.
//!
//! Transitions are computed by [`PendingSyncAudit::apply`] and written with a
//! compare-and-swap on the `version` column, so concurrent confirmation
//! consumers cannot lose each other's updates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinisync_common::storage::SqlCipherConnection;
use clinisync_core::AuditStore;
use clinisync_domain::constants::{SECURITY_ERROR_PREFIX, VALIDATION_ERROR_PREFIX};
use clinisync_domain::{
    AuditEvent, AuditStatus, ClinisyncError, NewPendingSync, PendingSyncAudit,
    Result as DomainResult, SyncKind, TransitionOutcome,
};
use rusqlite::{Row, ToSql};
use tokio::task;
use tracing::{debug, warn};
use uuid::Uuid;

use super::codec::{
    i64_to_u32, i64_to_u64, json_at, millis_at, opt_uuid_at, optional, parsed_at, to_millis,
    usize_to_i64, uuid_at,
};
use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

/// Attempts before a contended transition gives up with `Conflict`.
const MAX_CAS_ATTEMPTS: usize = 5;

/// SQLCipher implementation of [`AuditStore`].
pub struct SqlCipherAuditRepository {
    db: Arc<DbManager>,
}

impl SqlCipherAuditRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn insert_row(conn: &SqlCipherConnection, row: &PendingSyncAudit) -> DomainResult<()> {
        let request_json = row.request.to_json()?;
        let id = row.id.to_string();
        let tenant_id = row.tenant_id.to_string();
        let document_id = row.document_id.map(|id| id.to_string());
        let created_at = to_millis(row.created_at);
        let updated_at = to_millis(row.updated_at);
        let params: [&dyn ToSql; 12] = [
            &id,
            &row.kind.as_str(),
            &row.subject_id,
            &tenant_id,
            &document_id,
            &row.status.as_str(),
            &row.attempt_count,
            &row.last_error,
            &request_json,
            &row.version,
            &created_at,
            &updated_at,
        ];

        conn.execute(AUDIT_INSERT_SQL, params.as_slice()).map(|_| ()).map_err(map_storage_error)
    }

    fn fetch_by_id(conn: &SqlCipherConnection, id: Uuid) -> DomainResult<Option<PendingSyncAudit>> {
        let id = id.to_string();
        let params: [&dyn ToSql; 1] = [&id];
        optional(conn.query_row(AUDIT_SELECT_BY_ID_SQL, params.as_slice(), map_audit_row))
            .map_err(map_storage_error)
    }

    fn fetch_many(
        conn: &SqlCipherConnection,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> DomainResult<Vec<PendingSyncAudit>> {
        let mut stmt = conn.prepare(sql).map_err(map_storage_error)?;
        stmt.query_map(params, map_audit_row).map_err(map_storage_error)
    }

    /// Write `next` only if the stored row still has `expected_version`.
    fn compare_and_swap(
        conn: &SqlCipherConnection,
        next: &PendingSyncAudit,
        expected_version: i64,
    ) -> DomainResult<bool> {
        let id = next.id.to_string();
        let updated_at = to_millis(next.updated_at);
        let params: [&dyn ToSql; 7] = [
            &next.status.as_str(),
            &next.attempt_count,
            &next.last_error,
            &next.version,
            &updated_at,
            &id,
            &expected_version,
        ];
        let changed = conn.execute(AUDIT_CAS_SQL, params.as_slice()).map_err(map_storage_error)?;
        Ok(changed == 1)
    }

    fn apply_transition(
        conn: &SqlCipherConnection,
        id: Uuid,
        event: &AuditEvent,
    ) -> DomainResult<TransitionOutcome> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = Self::fetch_by_id(conn, id)?
                .ok_or_else(|| ClinisyncError::NotFound(format!("audit row {id}")))?;

            let outcome = current.apply(event, Utc::now());
            let TransitionOutcome::Applied(next) = &outcome else {
                return Ok(outcome);
            };

            if Self::compare_and_swap(conn, next, current.version)? {
                return Ok(outcome);
            }
            debug!(audit_id = %id, attempt, "audit version changed concurrently, retrying");
        }

        warn!(audit_id = %id, attempts = MAX_CAS_ATTEMPTS, "audit transition kept losing the race");
        Err(ClinisyncError::Conflict(format!(
            "audit row {id} changed concurrently {MAX_CAS_ATTEMPTS} times"
        )))
    }
}

#[async_trait]
impl AuditStore for SqlCipherAuditRepository {
    async fn create(&self, new: NewPendingSync) -> DomainResult<PendingSyncAudit> {
        let db = Arc::clone(&self.db);
        let row = PendingSyncAudit::new(new, Utc::now());

        task::spawn_blocking(move || -> DomainResult<PendingSyncAudit> {
            let conn = db.get_connection()?;
            Self::insert_row(&conn, &row)?;
            Ok(row)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<Option<PendingSyncAudit>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Option<PendingSyncAudit>> {
            let conn = db.get_connection()?;
            Self::fetch_by_id(&conn, id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_by_subject_and_tenant(
        &self,
        kind: SyncKind,
        subject_id: &str,
        tenant_id: Uuid,
    ) -> DomainResult<Option<PendingSyncAudit>> {
        let db = Arc::clone(&self.db);
        let subject_id = subject_id.to_string();

        task::spawn_blocking(move || -> DomainResult<Option<PendingSyncAudit>> {
            let conn = db.get_connection()?;
            let tenant_id = tenant_id.to_string();
            let params: [&dyn ToSql; 3] = [&kind.as_str(), &subject_id, &tenant_id];
            optional(conn.query_row(AUDIT_SELECT_BY_KEY_SQL, params.as_slice(), map_audit_row))
                .map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_by_subject(&self, subject_id: &str) -> DomainResult<Vec<PendingSyncAudit>> {
        let db = Arc::clone(&self.db);
        let subject_id = subject_id.to_string();

        task::spawn_blocking(move || -> DomainResult<Vec<PendingSyncAudit>> {
            let conn = db.get_connection()?;
            let params: [&dyn ToSql; 1] = [&subject_id];
            Self::fetch_many(&conn, AUDIT_SELECT_BY_SUBJECT_SQL, &params)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_by_document(&self, document_id: Uuid) -> DomainResult<Option<PendingSyncAudit>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Option<PendingSyncAudit>> {
            let conn = db.get_connection()?;
            let document_id = document_id.to_string();
            let params: [&dyn ToSql; 1] = [&document_id];
            optional(conn.query_row(
                AUDIT_SELECT_BY_DOCUMENT_SQL,
                params.as_slice(),
                map_audit_row,
            ))
            .map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> DomainResult<Vec<PendingSyncAudit>> {
        if limit == 0 || max_attempts == 0 {
            return Ok(Vec::new());
        }
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Vec<PendingSyncAudit>> {
            let conn = db.get_connection()?;
            let cutoff = to_millis(updated_before);
            let max_attempts = i64::from(max_attempts);
            let limit = usize_to_i64(limit);
            let validation = format!("{VALIDATION_ERROR_PREFIX}%");
            let security = format!("{SECURITY_ERROR_PREFIX}%");
            let params: [&dyn ToSql; 5] = [&cutoff, &max_attempts, &limit, &validation, &security];
            Self::fetch_many(&conn, AUDIT_SELECT_STALE_SQL, &params)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn count_by_tenant_and_status(
        &self,
        tenant_id: Uuid,
        status: AuditStatus,
    ) -> DomainResult<u64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<u64> {
            let conn = db.get_connection()?;
            let tenant_id = tenant_id.to_string();
            let params: [&dyn ToSql; 2] = [&tenant_id, &status.as_str()];
            conn.query_row(AUDIT_COUNT_SQL, params.as_slice(), |row| row.get::<_, i64>(0))
                .map(i64_to_u64)
                .map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn transition(&self, id: Uuid, event: AuditEvent) -> DomainResult<TransitionOutcome> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<TransitionOutcome> {
            let conn = db.get_connection()?;
            Self::apply_transition(&conn, id, &event)
        })
        .await
        .map_err(map_join_error)?
    }
}

const AUDIT_INSERT_SQL: &str = "INSERT INTO pending_sync_audit (
        id, kind, subject_id, tenant_id, document_id, status, attempt_count,
        last_error, request_json, version, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const AUDIT_SELECT_BY_ID_SQL: &str = "SELECT id, kind, subject_id, tenant_id, document_id, status,
        attempt_count, last_error, request_json, version, created_at, updated_at
    FROM pending_sync_audit
    WHERE id = ?1";

const AUDIT_SELECT_BY_KEY_SQL: &str = "SELECT id, kind, subject_id, tenant_id, document_id, status,
        attempt_count, last_error, request_json, version, created_at, updated_at
    FROM pending_sync_audit
    WHERE kind = ?1 AND subject_id = ?2 AND tenant_id = ?3
    ORDER BY CASE WHEN status IN ('PENDING', 'ERROR') THEN 0 ELSE 1 END,
             created_at DESC, id DESC
    LIMIT 1";

const AUDIT_SELECT_BY_SUBJECT_SQL: &str = "SELECT id, kind, subject_id, tenant_id, document_id,
        status, attempt_count, last_error, request_json, version, created_at, updated_at
    FROM pending_sync_audit
    WHERE subject_id = ?1
    ORDER BY created_at DESC, id DESC";

const AUDIT_SELECT_BY_DOCUMENT_SQL: &str = "SELECT id, kind, subject_id, tenant_id, document_id,
        status, attempt_count, last_error, request_json, version, created_at, updated_at
    FROM pending_sync_audit
    WHERE document_id = ?1
    ORDER BY created_at DESC, id DESC
    LIMIT 1";

const AUDIT_SELECT_STALE_SQL: &str = "SELECT id, kind, subject_id, tenant_id, document_id, status,
        attempt_count, last_error, request_json, version, created_at, updated_at
    FROM pending_sync_audit
    WHERE status IN ('PENDING', 'ERROR') AND updated_at < ?1
      AND attempt_count < ?2
      AND (last_error IS NULL OR (last_error NOT LIKE ?4 AND last_error NOT LIKE ?5))
    ORDER BY updated_at ASC
    LIMIT ?3";

const AUDIT_COUNT_SQL: &str =
    "SELECT COUNT(*) FROM pending_sync_audit WHERE tenant_id = ?1 AND status = ?2";

const AUDIT_CAS_SQL: &str = "UPDATE pending_sync_audit
    SET status = ?1, attempt_count = ?2, last_error = ?3, version = ?4, updated_at = ?5
    WHERE id = ?6 AND version = ?7";

fn map_audit_row(row: &Row<'_>) -> rusqlite::Result<PendingSyncAudit> {
    Ok(PendingSyncAudit {
        id: uuid_at(row, 0)?,
        kind: parsed_at(row, 1)?,
        subject_id: row.get(2)?,
        tenant_id: uuid_at(row, 3)?,
        document_id: opt_uuid_at(row, 4)?,
        status: parsed_at(row, 5)?,
        attempt_count: i64_to_u32(row.get(6)?),
        last_error: row.get(7)?,
        request: json_at(row, 8)?,
        version: row.get(9)?,
        created_at: millis_at(row, 10)?,
        updated_at: millis_at(row, 11)?,
    })
}
