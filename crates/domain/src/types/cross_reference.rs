//! Peripheral documents and their set-once link to the central aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::messages::DocumentSyncRequest;
use crate::errors::{ClinisyncError, Result};

/// Clinical document as stored on the peripheral node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDocument {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subject_id: String,
    /// Central aggregate id, unset until a success confirmation arrives.
    pub aggregate_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LocalDocument {
    pub fn new(id: Uuid, tenant_id: Uuid, subject_id: impl Into<String>) -> Self {
        Self { id, tenant_id, subject_id: subject_id.into(), aggregate_id: None, created_at: Utc::now() }
    }

    pub const fn cross_reference(&self) -> DocumentCrossReference {
        DocumentCrossReference { document_id: self.id, aggregate_id: self.aggregate_id }
    }

    pub fn sync_request(&self) -> Result<DocumentSyncRequest> {
        DocumentSyncRequest::new(self.id, self.subject_id.clone(), self.tenant_id)
    }

    /// Same document registered by the same clinic for the same subject.
    /// The cross-reference and creation time are ignored.
    pub fn is_same_registration(&self, other: &Self) -> bool {
        self.id == other.id && self.tenant_id == other.tenant_id && self.subject_id == other.subject_id
    }
}

/// Result of a cross-reference write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossReferenceWrite {
    /// The link was unset and has been written.
    Set,
    /// The link already held the same value.
    AlreadySet,
}

/// Link between a local document and its central aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentCrossReference {
    pub document_id: Uuid,
    pub aggregate_id: Option<Uuid>,
}

impl DocumentCrossReference {
    /// Decide what writing `incoming` would do. A conflicting value is a
    /// security error: the stored link is never overwritten.
    pub fn check_write(&self, incoming: Uuid) -> Result<CrossReferenceWrite> {
        match self.aggregate_id {
            None => Ok(CrossReferenceWrite::Set),
            Some(existing) if existing == incoming => Ok(CrossReferenceWrite::AlreadySet),
            Some(existing) => Err(ClinisyncError::Security(format!(
                "document {} is already linked to aggregate {existing}, refusing {incoming}",
                self.document_id
            ))),
        }
    }
}

/// Outcome of registering a document centrally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRegistration {
    pub aggregate_id: Uuid,
    /// The aggregate did not exist before this call.
    pub aggregate_created: bool,
    /// The link did not exist before this call.
    pub newly_linked: bool,
}

/// Outcome of registering a patient centrally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRegistration {
    pub patient_id: Uuid,
    pub already_registered: bool,
}
