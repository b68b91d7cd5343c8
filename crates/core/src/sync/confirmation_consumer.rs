//! Peripheral consumer of the `document-sync-confirmation` queue.

use std::sync::Arc;

use async_trait::async_trait;
use clinisync_domain::{
    AuditEvent, ClinisyncError, CrossReferenceWrite, Delivery, DocumentSyncConfirmation,
    FailureKind, QueueName, Result, SyncKind, SyncMessage, TransitionOutcome,
};
use tracing::{debug, error, info, instrument, warn};

use super::ports::{AuditStore, Disposition, DocumentStore, MessageHandler};
use super::{failure_message, truncate_error};

/// What a confirmation changed on the peripheral node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationReport {
    /// `None` when the local document is unknown or the confirmation failed.
    pub cross_reference: Option<CrossReferenceWrite>,
    /// `None` when no ledger row matched.
    pub audit: Option<TransitionOutcome>,
}

/// Applies document confirmations: sets the cross reference once and moves
/// the ledger row to RESOLVED or ERROR.
pub struct DocumentConfirmationConsumer {
    documents: Arc<dyn DocumentStore>,
    audits: Arc<dyn AuditStore>,
}

impl DocumentConfirmationConsumer {
    pub fn new(documents: Arc<dyn DocumentStore>, audits: Arc<dyn AuditStore>) -> Self {
        Self { documents, audits }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.id))]
    pub async fn process(&self, delivery: &Delivery) -> Result<ConfirmationReport> {
        let confirmation = match SyncMessage::from_json(&delivery.payload)? {
            SyncMessage::DocumentSyncConfirmation(confirmation) => confirmation,
            other => {
                return Err(ClinisyncError::Validation(format!(
                    "expected document_sync_confirmation, got {}",
                    other.kind()
                )))
            }
        };
        confirmation.validate()?;
        self.apply(&confirmation).await
    }

    /// Apply an already decoded confirmation.
    pub async fn apply(&self, confirmation: &DocumentSyncConfirmation) -> Result<ConfirmationReport> {
        let cross_reference = match self.link_document(confirmation).await {
            Ok(write) => write,
            Err(err) if err.failure_kind() == FailureKind::Security => {
                self.record_security_failure(confirmation, &err).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let audit = self.transition_audit(confirmation).await?;
        Ok(ConfirmationReport { cross_reference, audit })
    }

    async fn link_document(
        &self,
        confirmation: &DocumentSyncConfirmation,
    ) -> Result<Option<CrossReferenceWrite>> {
        let Some(document) = self.documents.find(confirmation.document_id).await? else {
            warn!(document_id = %confirmation.document_id, "Confirmation for unknown local document");
            return Ok(None);
        };

        if document.tenant_id != confirmation.tenant_id {
            return Err(ClinisyncError::Security(format!(
                "confirmation tenant {} does not own document {}",
                confirmation.tenant_id, document.id
            )));
        }

        if !confirmation.success {
            return Ok(None);
        }
        let Some(aggregate_id) = confirmation.aggregate_id else {
            return Err(ClinisyncError::Validation(
                "successful confirmation requires an aggregateId".into(),
            ));
        };

        let write = self.documents.set_cross_reference(document.id, aggregate_id).await?;
        match write {
            CrossReferenceWrite::Set => {
                info!(document_id = %document.id, %aggregate_id, "Cross reference stored");
            }
            CrossReferenceWrite::AlreadySet => {
                debug!(document_id = %document.id, "Cross reference already stored");
            }
        }
        Ok(Some(write))
    }

    async fn transition_audit(
        &self,
        confirmation: &DocumentSyncConfirmation,
    ) -> Result<Option<TransitionOutcome>> {
        let audit = match self.audits.find_by_document(confirmation.document_id).await? {
            Some(audit) => Some(audit),
            None => {
                self.audits
                    .find_by_subject_and_tenant(
                        SyncKind::Document,
                        &confirmation.subject_id,
                        confirmation.tenant_id,
                    )
                    .await?
            }
        };
        let Some(audit) = audit else {
            warn!(
                document_id = %confirmation.document_id,
                subject_id = %confirmation.subject_id,
                "No pending sync row for confirmation"
            );
            return Ok(None);
        };
        if audit.tenant_id != confirmation.tenant_id {
            return Err(ClinisyncError::Security(format!(
                "confirmation tenant {} does not own audit row {}",
                confirmation.tenant_id, audit.id
            )));
        }

        let event = if confirmation.success {
            AuditEvent::Resolve
        } else {
            AuditEvent::Error {
                message: truncate_error(confirmation.error_message.as_deref().unwrap_or_default()),
            }
        };
        let outcome = self.audits.transition(audit.id, event).await?;
        log_transition(&outcome);
        Ok(Some(outcome))
    }

    /// A conflicting aggregate id leaves the row in ERROR for an operator.
    /// Tenant mismatches do not touch the ledger.
    async fn record_security_failure(
        &self,
        confirmation: &DocumentSyncConfirmation,
        err: &ClinisyncError,
    ) {
        error!(
            document_id = %confirmation.document_id,
            tenant_id = %confirmation.tenant_id,
            error = %err,
            "Security violation while applying confirmation"
        );
        let Ok(Some(audit)) = self.audits.find_by_document(confirmation.document_id).await else {
            return;
        };
        if audit.tenant_id != confirmation.tenant_id {
            return;
        }
        let event = AuditEvent::Error { message: failure_message(err) };
        if let Err(update_err) = self.audits.transition(audit.id, event).await {
            warn!(audit_id = %audit.id, error = %update_err, "Failed to flag audit row");
        }
    }
}

fn log_transition(outcome: &TransitionOutcome) {
    match outcome {
        TransitionOutcome::Applied(audit) => {
            info!(audit_id = %audit.id, status = %audit.status, attempts = audit.attempt_count, "Audit row updated");
        }
        TransitionOutcome::Unchanged(audit) => {
            debug!(audit_id = %audit.id, status = %audit.status, "Duplicate confirmation ignored");
        }
        TransitionOutcome::Rejected { current, attempted } => {
            warn!(
                audit_id = %current.id,
                status = %current.status,
                attempted = %attempted,
                "Confirmation does not apply to audit row state"
            );
        }
    }
}

/// Map a processing result onto a broker disposition.
pub(crate) fn disposition_for<T>(result: Result<T>) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(err) => match err.failure_kind() {
            FailureKind::Transient => {
                warn!(error = %err, "Confirmation processing failed, will retry");
                Disposition::retry(err.to_string())
            }
            FailureKind::NotFound => {
                warn!(error = %err, "Confirmation references a missing record");
                Disposition::Ack
            }
            FailureKind::Security => {
                error!(error = %err, "Dropping confirmation");
                Disposition::reject(err.to_string())
            }
            FailureKind::Validation => {
                warn!(error = %err, "Dropping invalid confirmation");
                Disposition::reject(err.to_string())
            }
        },
    }
}

#[async_trait]
impl MessageHandler for DocumentConfirmationConsumer {
    fn name(&self) -> &'static str {
        "document-confirmation-consumer"
    }

    fn queue(&self) -> QueueName {
        QueueName::DocumentConfirmation
    }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        disposition_for(self.process(delivery).await)
    }
}
