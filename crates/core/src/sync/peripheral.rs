//! Entry point for a clinic registering documents and patients.

use std::sync::Arc;

use clinisync_domain::{
    LocalDocument, MessageId, NewPendingSync, PendingSyncAudit, Result, TransitionOutcome,
    UserSyncRequest,
};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::document_producer::DocumentSyncProducer;
use super::ports::{AuditStore, DocumentStore, MessageBroker};
use super::user_sync::UserSyncProducer;

/// Records the obligation before sending so a failed send is never lost:
/// the PENDING ledger row stays behind for reconciliation.
pub struct PeripheralSyncService {
    tenant_id: Uuid,
    documents: Arc<dyn DocumentStore>,
    audits: Arc<dyn AuditStore>,
    document_producer: DocumentSyncProducer,
    user_producer: UserSyncProducer,
}

impl PeripheralSyncService {
    pub fn new(
        tenant_id: Uuid,
        documents: Arc<dyn DocumentStore>,
        audits: Arc<dyn AuditStore>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            tenant_id,
            documents,
            audits,
            document_producer: DocumentSyncProducer::new(Arc::clone(&broker)),
            user_producer: UserSyncProducer::new(broker),
        }
    }

    pub const fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// Store a new clinical document and send it to the central node.
    ///
    /// Safe to call again after a failure: the document insert is
    /// idempotent and an existing ledger row for the document is reused, so
    /// a retry picks up where the failed call stopped.
    #[instrument(skip(self, subject_id), fields(tenant_id = %self.tenant_id))]
    pub async fn register_document(&self, document_id: Uuid, subject_id: &str) -> Result<MessageId> {
        let document = LocalDocument::new(document_id, self.tenant_id, subject_id);
        let request = document.sync_request()?;

        self.documents.insert(&document).await?;
        let audit = match self.audits.find_by_document(document_id).await? {
            Some(existing) => {
                debug!(
                    %document_id,
                    audit_id = %existing.id,
                    status = %existing.status,
                    "Reusing ledger row"
                );
                existing
            }
            None => self.audits.create(NewPendingSync::for_document(&request)).await?,
        };

        match self.document_producer.enqueue_request(&request).await {
            Ok(message_id) => {
                info!(%document_id, audit_id = %audit.id, %message_id, "Document registered for sync");
                Ok(message_id)
            }
            Err(err) => {
                error!(%document_id, audit_id = %audit.id, error = %err, "Document stored but not sent");
                Err(err)
            }
        }
    }

    /// Send a patient registration; the request is stamped with this clinic.
    #[instrument(skip(self, request), fields(tenant_id = %self.tenant_id, subject_id = %request.subject_id))]
    pub async fn register_patient(&self, request: UserSyncRequest) -> Result<MessageId> {
        let new = NewPendingSync::for_user(&request, self.tenant_id);
        let request = request.with_tenant(self.tenant_id);
        let audit = self.audits.create(new).await?;

        match self.user_producer.enqueue(&request).await {
            Ok(message_id) => {
                info!(audit_id = %audit.id, %message_id, "Patient registered for sync");
                Ok(message_id)
            }
            Err(err) => {
                error!(audit_id = %audit.id, error = %err, "Patient recorded but not sent");
                Err(err)
            }
        }
    }

    pub async fn document(&self, document_id: Uuid) -> Result<Option<LocalDocument>> {
        self.documents.find(document_id).await
    }

    pub async fn audit_for_document(&self, document_id: Uuid) -> Result<Option<PendingSyncAudit>> {
        self.audits.find_by_document(document_id).await
    }

    /// Give up on a row stuck in ERROR.
    pub async fn cancel(&self, audit_id: Uuid) -> Result<TransitionOutcome> {
        self.audits.mark_cancelled(audit_id).await
    }
}
