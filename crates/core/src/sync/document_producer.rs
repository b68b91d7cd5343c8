//! Peripheral side of document synchronization.

use std::sync::Arc;

use clinisync_domain::{
    DocumentSyncDraft, DocumentSyncRequest, MessageId, OutboundMessage, Result,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::ports::MessageBroker;

/// Publishes [`DocumentSyncRequest`]s on the `document-sync` queue.
#[derive(Clone)]
pub struct DocumentSyncProducer {
    broker: Arc<dyn MessageBroker>,
}

impl DocumentSyncProducer {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    /// Durable send. Broker failures propagate so the obligation is never
    /// lost silently.
    pub async fn enqueue(
        &self,
        document_id: Uuid,
        subject_id: &str,
        tenant_id: Uuid,
    ) -> Result<MessageId> {
        let request = DocumentSyncRequest::new(document_id, subject_id, tenant_id)?;
        self.enqueue_request(&request).await
    }

    #[instrument(skip(self, request), fields(document_id = %request.document_id, tenant_id = %request.tenant_id))]
    pub async fn enqueue_request(&self, request: &DocumentSyncRequest) -> Result<MessageId> {
        let message = OutboundMessage::new(request.clone());
        match self.broker.publish(&message).await {
            Ok(id) => {
                debug!(message_id = %id, "Document sync request enqueued");
                Ok(id)
            }
            Err(err) => {
                error!(error = %err, "Failed to enqueue document sync request");
                Err(err)
            }
        }
    }

    /// Send every valid entry; returns how many were accepted by the broker.
    pub async fn enqueue_many(&self, drafts: &[DocumentSyncDraft]) -> usize {
        let mut sent = 0;
        for (index, draft) in drafts.iter().enumerate() {
            let request = match draft.validate() {
                Ok(request) => request,
                Err(err) => {
                    warn!(index, error = %err, "Skipping invalid document sync entry");
                    continue;
                }
            };
            if self.enqueue_request(&request).await.is_ok() {
                sent += 1;
            }
        }
        info!(total = drafts.len(), sent, "Document sync batch enqueued");
        sent
    }
}
