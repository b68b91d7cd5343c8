//! Central patient index, unique by subject identifier.

use std::sync::Arc;

use async_trait::async_trait;
use clinisync_core::PatientRegistry;
use clinisync_domain::{
    ClinisyncError, PatientRegistration, Result as DomainResult, UserSyncRequest,
};
use rusqlite::ToSql;
use tokio::task;
use tracing::debug;
use uuid::Uuid;

use super::codec::{now_millis, optional, uuid_at};
use super::manager::DbManager;
use crate::errors::{map_join_error, map_storage_error};

/// SQLCipher implementation of [`PatientRegistry`].
pub struct SqlCipherPatientRepository {
    db: Arc<DbManager>,
}

impl SqlCipherPatientRepository {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PatientRegistry for SqlCipherPatientRepository {
    async fn register(&self, request: &UserSyncRequest) -> DomainResult<PatientRegistration> {
        let db = Arc::clone(&self.db);
        let request = request.clone();

        task::spawn_blocking(move || -> DomainResult<PatientRegistration> {
            let conn = db.get_connection()?;
            let candidate = Uuid::now_v7().to_string();
            let tenant_id = request.tenant_id.map(|id| id.to_string());
            let profile_json = request
                .profile
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| ClinisyncError::Internal(format!("failed to encode profile: {e}")))?;
            let created_at = now_millis();
            let params: [&dyn ToSql; 6] = [
                &candidate,
                &request.subject_id,
                &request.document_type.code(),
                &tenant_id,
                &profile_json,
                &created_at,
            ];
            let inserted =
                conn.execute(PATIENT_INSERT_SQL, params.as_slice()).map_err(map_storage_error)?;

            let patient_id = conn
                .query_row(PATIENT_SELECT_SQL, &[&request.subject_id], |row| uuid_at(row, 0))
                .map_err(map_storage_error)?;
            debug!(
                subject_id = %request.subject_id,
                patient_id = %patient_id,
                already_registered = inserted == 0,
                "patient registration applied"
            );
            Ok(PatientRegistration { patient_id, already_registered: inserted == 0 })
        })
        .await
        .map_err(map_join_error)?
    }

    async fn find_patient(&self, subject_id: &str) -> DomainResult<Option<Uuid>> {
        let db = Arc::clone(&self.db);
        let subject_id = subject_id.to_string();

        task::spawn_blocking(move || -> DomainResult<Option<Uuid>> {
            let conn = db.get_connection()?;
            optional(conn.query_row(PATIENT_SELECT_SQL, &[&subject_id], |row| uuid_at(row, 0)))
                .map_err(map_storage_error)
        })
        .await
        .map_err(map_join_error)?
    }
}

const PATIENT_INSERT_SQL: &str = "INSERT OR IGNORE INTO patients (
        id, subject_id, document_type, tenant_id, profile_json, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const PATIENT_SELECT_SQL: &str = "SELECT id FROM patients WHERE subject_id = ?1";
