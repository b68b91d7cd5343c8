//! Central consumer of the `document-sync` queue.
//!
//! Each delivery walks RECEIVED → VALIDATED → APPLIED → CONFIRMED. The
//! registration is idempotent, so a redelivered request links nothing new
//! and reuses the existing aggregate id.

use std::sync::Arc;

use async_trait::async_trait;
use clinisync_domain::{
    ClinisyncError, Delivery, DocumentSyncConfirmation, DocumentSyncDraft, FailureKind, QueueName,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::confirmation_producer::ConfirmationProducer;
use super::failure_message;
use super::ports::{AggregateRepository, Disposition, MessageHandler};

/// Furthest point a delivery reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessingStage {
    Received,
    Validated,
    Applied,
    Confirmed,
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOutcome {
    pub stage: ProcessingStage,
    pub disposition: Disposition,
    pub aggregate_id: Option<Uuid>,
}

impl ProcessingOutcome {
    const fn new(stage: ProcessingStage, disposition: Disposition) -> Self {
        Self { stage, disposition, aggregate_id: None }
    }
}

pub struct DocumentSyncConsumer {
    aggregates: Arc<dyn AggregateRepository>,
    confirmations: ConfirmationProducer,
}

impl DocumentSyncConsumer {
    pub fn new(aggregates: Arc<dyn AggregateRepository>, confirmations: ConfirmationProducer) -> Self {
        Self { aggregates, confirmations }
    }

    #[instrument(skip(self, delivery), fields(
        message_id = %delivery.id,
        delivery_count = delivery.delivery_count,
    ))]
    pub async fn process(&self, delivery: &Delivery) -> ProcessingOutcome {
        let correlation_id = delivery.id.to_string();

        let draft = match DocumentSyncDraft::parse(&delivery.payload) {
            Ok(draft) => draft,
            Err(err) => {
                warn!(error = %err, "Dropping unreadable document sync payload");
                return ProcessingOutcome::new(
                    ProcessingStage::Received,
                    Disposition::reject(err.to_string()),
                );
            }
        };

        let request = match draft.validate() {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Dropping invalid document sync request");
                self.notify_failure(&draft, &err, &correlation_id).await;
                return ProcessingOutcome::new(
                    ProcessingStage::Received,
                    Disposition::reject(err.to_string()),
                );
            }
        };

        let registration = match self.aggregates.register_document(&request).await {
            Ok(registration) => registration,
            Err(err) => {
                let disposition = match err.failure_kind() {
                    FailureKind::Security => {
                        error!(
                            document_id = %request.document_id,
                            tenant_id = %request.tenant_id,
                            error = %err,
                            "Refusing document registration"
                        );
                        Disposition::reject(err.to_string())
                    }
                    FailureKind::Validation => {
                        warn!(document_id = %request.document_id, error = %err, "Registration rejected");
                        Disposition::reject(err.to_string())
                    }
                    FailureKind::Transient | FailureKind::NotFound => {
                        warn!(document_id = %request.document_id, error = %err, "Registration failed, will retry");
                        Disposition::retry(err.to_string())
                    }
                };
                self.notify_failure(&DocumentSyncDraft::from(request), &err, &correlation_id).await;
                return ProcessingOutcome::new(ProcessingStage::Validated, disposition);
            }
        };

        if registration.newly_linked {
            info!(
                document_id = %request.document_id,
                aggregate_id = %registration.aggregate_id,
                aggregate_created = registration.aggregate_created,
                "Document linked to clinical history"
            );
        } else {
            debug!(document_id = %request.document_id, "Document already linked, reusing aggregate");
        }

        let confirmation =
            DocumentSyncConfirmation::success(&request, registration.aggregate_id, &correlation_id);
        let stage = match self.confirmations.send_document(confirmation).await {
            Ok(_) => ProcessingStage::Confirmed,
            Err(err) => {
                // Registration is committed; a redelivery would only repeat it.
                warn!(document_id = %request.document_id, error = %err, "Failed to send success confirmation");
                ProcessingStage::Applied
            }
        };

        ProcessingOutcome {
            stage,
            disposition: Disposition::Ack,
            aggregate_id: Some(registration.aggregate_id),
        }
    }

    /// Best-effort failure confirmation, only possible when the ids that
    /// route it back can be read from the payload.
    async fn notify_failure(
        &self,
        draft: &DocumentSyncDraft,
        err: &ClinisyncError,
        correlation_id: &str,
    ) {
        let (Some(document_id), Some(tenant_id)) = (draft.document_id, draft.tenant_id) else {
            debug!("No document or tenant id to route a failure confirmation");
            return;
        };
        let subject_id = draft
            .subject_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let confirmation = DocumentSyncConfirmation::failure(
            document_id,
            tenant_id,
            subject_id,
            failure_message(err),
            correlation_id,
        );
        if let Err(send_err) = self.confirmations.send_document(confirmation).await {
            warn!(%document_id, error = %send_err, "Failed to send failure confirmation");
        }
    }
}

#[async_trait]
impl MessageHandler for DocumentSyncConsumer {
    fn name(&self) -> &'static str {
        "document-sync-consumer"
    }

    fn queue(&self) -> QueueName {
        QueueName::DocumentSync
    }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        self.process(delivery).await.disposition
    }
}
