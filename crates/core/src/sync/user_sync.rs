//! Patient registration sync, both directions.

use std::sync::Arc;

use async_trait::async_trait;
use clinisync_domain::{
    AuditEvent, ClinisyncError, Delivery, FailureKind, MessageId, OutboundMessage,
    PendingSyncAudit, QueueName, Result, SyncKind, SyncMessage, TransitionOutcome,
    UserSyncConfirmation, UserSyncDraft, UserSyncRequest,
};
use tracing::{debug, error, info, instrument, warn};

use super::confirmation_consumer::disposition_for;
use super::confirmation_producer::ConfirmationProducer;
use super::ports::{AuditStore, Disposition, MessageBroker, MessageHandler, PatientRegistry};
use super::{failure_message, truncate_error};

/// Publishes [`UserSyncRequest`]s on the `user-sync` queue.
#[derive(Clone)]
pub struct UserSyncProducer {
    broker: Arc<dyn MessageBroker>,
}

impl UserSyncProducer {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    #[instrument(skip(self, request), fields(subject_id = %request.subject_id))]
    pub async fn enqueue(&self, request: &UserSyncRequest) -> Result<MessageId> {
        match self.broker.publish(&OutboundMessage::new(request.clone())).await {
            Ok(id) => {
                debug!(message_id = %id, "User sync request enqueued");
                Ok(id)
            }
            Err(err) => {
                error!(error = %err, "Failed to enqueue user sync request");
                Err(err)
            }
        }
    }

    /// Send every valid entry; returns how many were accepted by the broker.
    pub async fn enqueue_many(&self, drafts: &[UserSyncDraft]) -> usize {
        let mut sent = 0;
        for (index, draft) in drafts.iter().enumerate() {
            let request = match draft.validate() {
                Ok(request) => request,
                Err(err) => {
                    warn!(index, error = %err, "Skipping invalid user sync entry");
                    continue;
                }
            };
            if self.enqueue(&request).await.is_ok() {
                sent += 1;
            }
        }
        info!(total = drafts.len(), sent, "User sync batch enqueued");
        sent
    }
}

/// Central consumer of the `user-sync` queue.
pub struct UserSyncConsumer {
    patients: Arc<dyn PatientRegistry>,
    confirmations: ConfirmationProducer,
}

impl UserSyncConsumer {
    pub fn new(patients: Arc<dyn PatientRegistry>, confirmations: ConfirmationProducer) -> Self {
        Self { patients, confirmations }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.id, delivery_count = delivery.delivery_count))]
    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        let correlation_id = delivery.id.to_string();

        let draft = match UserSyncDraft::parse(&delivery.payload) {
            Ok(draft) => draft,
            Err(err) => {
                warn!(error = %err, "Dropping unreadable user sync payload");
                return Disposition::reject(err.to_string());
            }
        };
        let request = match draft.validate() {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Dropping invalid user sync request");
                self.notify_failure(&draft, &err, &correlation_id).await;
                return Disposition::reject(err.to_string());
            }
        };

        let registration = match self.patients.register(&request).await {
            Ok(registration) => registration,
            Err(err) => {
                self.notify_failure(&draft, &err, &correlation_id).await;
                return match err.failure_kind() {
                    FailureKind::Transient | FailureKind::NotFound => {
                        warn!(subject_id = %request.subject_id, error = %err, "Patient registration failed, will retry");
                        Disposition::retry(err.to_string())
                    }
                    FailureKind::Security => {
                        error!(subject_id = %request.subject_id, error = %err, "Refusing patient registration");
                        Disposition::reject(err.to_string())
                    }
                    FailureKind::Validation => Disposition::reject(err.to_string()),
                };
            }
        };

        if registration.already_registered {
            debug!(subject_id = %request.subject_id, "Patient already registered");
        } else {
            info!(subject_id = %request.subject_id, patient_id = %registration.patient_id, "Patient registered");
        }

        let confirmation = UserSyncConfirmation::success(&request, &correlation_id);
        if let Err(err) = self.confirmations.send_user(confirmation).await {
            warn!(subject_id = %request.subject_id, error = %err, "Failed to send user confirmation");
        }
        Disposition::Ack
    }

    async fn notify_failure(&self, draft: &UserSyncDraft, err: &ClinisyncError, correlation_id: &str) {
        let Some(subject_id) = draft.subject_id.clone().filter(|s| !s.trim().is_empty()) else {
            debug!("No subject id to route a failure confirmation");
            return;
        };
        let confirmation = UserSyncConfirmation::failure(
            subject_id,
            draft.tenant_id,
            failure_message(err),
            correlation_id,
        );
        if let Err(send_err) = self.confirmations.send_user(confirmation).await {
            warn!(error = %send_err, "Failed to send user failure confirmation");
        }
    }
}

#[async_trait]
impl MessageHandler for UserSyncConsumer {
    fn name(&self) -> &'static str {
        "user-sync-consumer"
    }

    fn queue(&self) -> QueueName {
        QueueName::UserSync
    }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        self.process(delivery).await
    }
}

/// Peripheral consumer of the `user-sync-confirmation` queue.
pub struct UserConfirmationConsumer {
    audits: Arc<dyn AuditStore>,
}

impl UserConfirmationConsumer {
    pub fn new(audits: Arc<dyn AuditStore>) -> Self {
        Self { audits }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.id))]
    pub async fn process(&self, delivery: &Delivery) -> Result<Option<TransitionOutcome>> {
        let confirmation = match SyncMessage::from_json(&delivery.payload)? {
            SyncMessage::UserSyncConfirmation(confirmation) => confirmation,
            other => {
                return Err(ClinisyncError::Validation(format!(
                    "expected user_sync_confirmation, got {}",
                    other.kind()
                )))
            }
        };
        confirmation.validate()?;
        self.apply(&confirmation).await
    }

    pub async fn apply(
        &self,
        confirmation: &UserSyncConfirmation,
    ) -> Result<Option<TransitionOutcome>> {
        let Some(audit) = self.locate(confirmation).await? else {
            warn!(subject_id = %confirmation.subject_id, "No pending user sync row for confirmation");
            return Ok(None);
        };

        let event = if confirmation.success {
            AuditEvent::Resolve
        } else {
            AuditEvent::Error {
                message: truncate_error(confirmation.error_message.as_deref().unwrap_or_default()),
            }
        };
        let outcome = self.audits.transition(audit.id, event).await?;
        match &outcome {
            TransitionOutcome::Applied(row) => {
                info!(audit_id = %row.id, status = %row.status, "User audit row updated");
            }
            TransitionOutcome::Unchanged(row) => {
                debug!(audit_id = %row.id, "Duplicate user confirmation ignored");
            }
            TransitionOutcome::Rejected { current, attempted } => {
                warn!(audit_id = %current.id, status = %current.status, attempted = %attempted, "User confirmation does not apply");
            }
        }
        Ok(Some(outcome))
    }

    /// Exact lookup when the tenant is echoed back, otherwise the most
    /// recently created open row for the subject.
    async fn locate(&self, confirmation: &UserSyncConfirmation) -> Result<Option<PendingSyncAudit>> {
        if let Some(tenant_id) = confirmation.tenant_id {
            return self
                .audits
                .find_by_subject_and_tenant(SyncKind::User, &confirmation.subject_id, tenant_id)
                .await;
        }

        let rows = self.audits.find_by_subject(&confirmation.subject_id).await?;
        let mut user_rows: Vec<PendingSyncAudit> =
            rows.into_iter().filter(|row| row.kind == SyncKind::User).collect();
        user_rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let newest_open = user_rows.iter().position(PendingSyncAudit::is_open);
        Ok(match newest_open {
            Some(index) => Some(user_rows.swap_remove(index)),
            None => user_rows.into_iter().next(),
        })
    }
}

#[async_trait]
impl MessageHandler for UserConfirmationConsumer {
    fn name(&self) -> &'static str {
        "user-confirmation-consumer"
    }

    fn queue(&self) -> QueueName {
        QueueName::UserConfirmation
    }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        disposition_for(self.process(delivery).await)
    }
}
