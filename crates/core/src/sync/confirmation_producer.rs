//! Central side replies to peripheral nodes.

use std::sync::Arc;

use clinisync_domain::{
    DocumentSyncConfirmation, MessageId, OutboundMessage, Result, UserSyncConfirmation,
};
use tracing::{debug, instrument};

use super::ports::MessageBroker;

/// Validates and publishes confirmations, correlated with the request's
/// message id.
#[derive(Clone)]
pub struct ConfirmationProducer {
    broker: Arc<dyn MessageBroker>,
}

impl ConfirmationProducer {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    #[instrument(skip(self, confirmation), fields(
        document_id = %confirmation.document_id,
        tenant_id = %confirmation.tenant_id,
        success = confirmation.success,
    ))]
    pub async fn send_document(&self, confirmation: DocumentSyncConfirmation) -> Result<MessageId> {
        confirmation.validate()?;
        let correlation_id = confirmation.correlation_id.clone();
        let id = self
            .broker
            .publish(&OutboundMessage::new(confirmation).with_correlation_id(correlation_id))
            .await?;
        debug!(message_id = %id, "Document confirmation sent");
        Ok(id)
    }

    #[instrument(skip(self, confirmation), fields(
        subject_id = %confirmation.subject_id,
        success = confirmation.success,
    ))]
    pub async fn send_user(&self, confirmation: UserSyncConfirmation) -> Result<MessageId> {
        confirmation.validate()?;
        let correlation_id = confirmation.correlation_id.clone();
        let id = self
            .broker
            .publish(&OutboundMessage::new(confirmation).with_correlation_id(correlation_id))
            .await?;
        debug!(message_id = %id, "User confirmation sent");
        Ok(id)
    }
}
