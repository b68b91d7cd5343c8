//! Central clinical histories and the documents linked to them.
//!
//! Registration runs in one IMMEDIATE transaction: the history is created or
//! fetched by subject and the document link inserted, so two consumers
//! handling a duplicated request cannot create two histories.

use std::sync::Arc;

use async_trait::async_trait;
use clinisync_core::AggregateRepository;
use clinisync_domain::{
    ClinisyncError, DocumentRegistration, DocumentSyncRequest, Result as DomainResult,
};
use rusqlite::{params, OptionalExtension, Transaction};
use tokio::task;
use tracing::{debug, error};
use uuid::Uuid;

use super::codec::{now_millis, optional};
use super::manager::DbManager;
use crate::errors::{map_join_error, map_sql_error, map_storage_error};

/// SQLCipher implementation of [`AggregateRepository`].
pub struct SqlCipherAggregateRepository {
    db: Arc<DbManager>,
}

impl SqlCipherAggregateRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    fn history_for(tx: &Transaction<'_>, subject_id: &str) -> DomainResult<(Uuid, bool)> {
        let existing: Option<String> = tx
            .query_row(HISTORY_SELECT_SQL, params![subject_id], |row| row.get(0))
            .optional()
            .map_err(map_sql_error)?;
        if let Some(raw) = existing {
            return parse_id(&raw).map(|id| (id, false));
        }

        let id = Uuid::now_v7();
        tx.execute(HISTORY_INSERT_SQL, params![id.to_string(), subject_id, now_millis()])
            .map_err(map_sql_error)?;
        Ok((id, true))
    }

    fn register(
        tx: &Transaction<'_>,
        request: &DocumentSyncRequest,
    ) -> DomainResult<DocumentRegistration> {
        let (aggregate_id, aggregate_created) = Self::history_for(tx, &request.subject_id)?;
        let document_id = request.document_id.to_string();

        let link: Option<(String, String)> = tx
            .query_row(LINK_SELECT_SQL, params![document_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .map_err(map_sql_error)?;

        if let Some((history_raw, tenant_raw)) = link {
            let linked_history = parse_id(&history_raw)?;
            let linked_tenant = parse_id(&tenant_raw)?;
            if linked_history != aggregate_id || linked_tenant != request.tenant_id {
                error!(
                    document_id = %request.document_id,
                    linked_history = %linked_history,
                    linked_tenant = %linked_tenant,
                    requested_tenant = %request.tenant_id,
                    "document already linked under another history or tenant"
                );
                return Err(ClinisyncError::Security(format!(
                    "document {} is already linked to history {linked_history}",
                    request.document_id
                )));
            }
            return Ok(DocumentRegistration { aggregate_id, aggregate_created, newly_linked: false });
        }

        tx.execute(
            LINK_INSERT_SQL,
            params![document_id, aggregate_id.to_string(), request.tenant_id.to_string(), now_millis()],
        )
        .map_err(map_sql_error)?;
        Ok(DocumentRegistration { aggregate_id, aggregate_created, newly_linked: true })
    }
}

#[async_trait]
impl AggregateRepository for SqlCipherAggregateRepository {
    async fn register_document(
        &self,
        request: &DocumentSyncRequest,
    ) -> DomainResult<DocumentRegistration> {
        let db = Arc::clone(&self.db);
        let request = request.clone();

        task::spawn_blocking(move || -> DomainResult<DocumentRegistration> {
            let mut conn = db.get_connection()?;
            let tx = conn.immediate_transaction().map_err(map_storage_error)?;
            // Dropping the transaction on an error path rolls it back.
            let registration = Self::register(&tx, &request)?;
            tx.commit().map_err(map_sql_error)?;
            debug!(
                document_id = %request.document_id,
                aggregate_id = %registration.aggregate_id,
                aggregate_created = registration.aggregate_created,
                newly_linked = registration.newly_linked,
                "document registered"
            );
            Ok(registration)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_aggregate(&self, subject_id: &str) -> DomainResult<Option<Uuid>> {
        let db = Arc::clone(&self.db);
        let subject_id = subject_id.to_string();

        task::spawn_blocking(move || -> DomainResult<Option<Uuid>> {
            let conn = db.get_connection()?;
            let raw: Option<String> = optional(conn.query_row(
                HISTORY_SELECT_SQL,
                &[&subject_id],
                |row| row.get(0),
            ))
            .map_err(map_storage_error)?;
            raw.as_deref().map(parse_id).transpose()
        })
        .await
        .map_err(map_join_error)?
    }

    async fn linked_documents(&self, aggregate_id: Uuid) -> DomainResult<Vec<Uuid>> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Vec<Uuid>> {
            let conn = db.get_connection()?;
            let history_id = aggregate_id.to_string();
            let mut stmt = conn.prepare(LINKED_DOCUMENTS_SQL).map_err(map_storage_error)?;
            let raw: Vec<String> =
                stmt.query_map(&[&history_id], |row| row.get(0)).map_err(map_storage_error)?;
            raw.iter().map(|id| parse_id(id)).collect()
        })
        .await
        .map_err(map_join_error)?
    }
}

const HISTORY_SELECT_SQL: &str = "SELECT id FROM clinical_histories WHERE subject_id = ?1";

const HISTORY_INSERT_SQL: &str =
    "INSERT INTO clinical_histories (id, subject_id, created_at) VALUES (?1, ?2, ?3)";

const LINK_SELECT_SQL: &str =
    "SELECT history_id, tenant_id FROM history_documents WHERE document_id = ?1";

const LINK_INSERT_SQL: &str = "INSERT INTO history_documents (
        document_id, history_id, tenant_id, linked_at
    ) VALUES (?1, ?2, ?3, ?4)";

const LINKED_DOCUMENTS_SQL: &str = "SELECT document_id FROM history_documents
    WHERE history_id = ?1
    ORDER BY linked_at ASC, rowid ASC";

fn parse_id(raw: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ClinisyncError::Database(format!("invalid stored id '{raw}': {e}")))
}
