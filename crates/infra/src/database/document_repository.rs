//! Peripheral clinical documents.

use std::sync::Arc;

use async_trait::async_trait;
use clinisync_common::storage::SqlCipherConnection;
use clinisync_core::DocumentStore;
use clinisync_domain::{ClinisyncError, CrossReferenceWrite, LocalDocument, Result as DomainResult};
use rusqlite::{Row, ToSql};
use tokio::task;
use tracing::{error, warn};
use uuid::Uuid;

use super::codec::{millis_at, opt_uuid_at, optional, to_millis, uuid_at};
use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

/// SQLCipher implementation of [`DocumentStore`].
pub struct SqlCipherDocumentRepository {
    db: Arc<DbManager>,
}

impl SqlCipherDocumentRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn fetch(conn: &SqlCipherConnection, document_id: Uuid) -> DomainResult<Option<LocalDocument>> {
        let id = document_id.to_string();
        let params: [&dyn ToSql; 1] = [&id];
        optional(conn.query_row(DOCUMENT_SELECT_SQL, params.as_slice(), map_document_row))
            .map_err(map_storage_error)
    }

    /// Set-once write: the UPDATE only touches an unset link, then the stored
    /// value decides between `Set`, `AlreadySet` and a conflict.
    fn write_cross_reference(
        conn: &SqlCipherConnection,
        document_id: Uuid,
        aggregate_id: Uuid,
    ) -> DomainResult<CrossReferenceWrite> {
        let id = document_id.to_string();
        let aggregate = aggregate_id.to_string();
        let params: [&dyn ToSql; 2] = [&aggregate, &id];
        let changed =
            conn.execute(DOCUMENT_LINK_SQL, params.as_slice()).map_err(map_storage_error)?;
        if changed == 1 {
            return Ok(CrossReferenceWrite::Set);
        }

        let document = Self::fetch(conn, document_id)?
            .ok_or_else(|| ClinisyncError::NotFound(format!("document {document_id}")))?;
        document.cross_reference().check_write(aggregate_id).inspect_err(|err| {
            error!(
                document_id = %document_id,
                stored = ?document.aggregate_id,
                incoming = %aggregate_id,
                error = %err,
                "refusing to overwrite document cross reference"
            );
        })
    }
}

#[async_trait]
impl DocumentStore for SqlCipherDocumentRepository {
    async fn insert(&self, document: &LocalDocument) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let document = document.clone();

        task::spawn_blocking(move || -> DomainResult<()> {
            let conn = db.get_connection()?;
            let id = document.id.to_string();
            let tenant_id = document.tenant_id.to_string();
            let aggregate_id = document.aggregate_id.map(|id| id.to_string());
            let created_at = to_millis(document.created_at);
            let params: [&dyn ToSql; 5] =
                [&id, &tenant_id, &document.subject_id, &aggregate_id, &created_at];

            let inserted =
                conn.execute(DOCUMENT_INSERT_SQL, params.as_slice()).map_err(map_storage_error)?;
            if inserted == 1 {
                return Ok(());
            }

            match Self::fetch(&conn, document.id)? {
                Some(stored) if stored.is_same_registration(&document) => Ok(()),
                _ => {
                    warn!(document_id = %document.id, "document id already used");
                    Err(ClinisyncError::Validation(format!(
                        "document {} already exists with another tenant or subject",
                        document.id
                    )))
                }
            }
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find(&self, document_id: Uuid) -> DomainResult<Option<LocalDocument>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Option<LocalDocument>> {
            let conn = db.get_connection()?;
            Self::fetch(&conn, document_id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn set_cross_reference(
        &self,
        document_id: Uuid,
        aggregate_id: Uuid,
    ) -> DomainResult<CrossReferenceWrite> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<CrossReferenceWrite> {
            let conn = db.get_connection()?;
            Self::write_cross_reference(&conn, document_id, aggregate_id)
        })
        .await
        .map_err(map_join_error)?
    }
}

const DOCUMENT_INSERT_SQL: &str = "INSERT OR IGNORE INTO local_documents (
        id, tenant_id, subject_id, aggregate_id, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5)";

const DOCUMENT_SELECT_SQL: &str = "SELECT id, tenant_id, subject_id, aggregate_id, created_at
    FROM local_documents
    WHERE id = ?1";

const DOCUMENT_LINK_SQL: &str =
    "UPDATE local_documents SET aggregate_id = ?1 WHERE id = ?2 AND aggregate_id IS NULL";

fn map_document_row(row: &Row<'_>) -> rusqlite::Result<LocalDocument> {
    Ok(LocalDocument {
        id: uuid_at(row, 0)?,
        tenant_id: uuid_at(row, 1)?,
        subject_id: row.get(2)?,
        aggregate_id: opt_uuid_at(row, 3)?,
        created_at: millis_at(row, 4)?,
    })
}
