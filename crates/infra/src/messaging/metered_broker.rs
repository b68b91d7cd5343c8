//! Broker wrapper that counts publish outcomes per queue.
//!
//! The central node hands this to its `ConfirmationProducer`, so failed
//! confirmation sends show up in the metrics snapshot even though the
//! consumers only log them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clinisync_core::MessageBroker;
use clinisync_domain::{
    DeadLetter, Delivery, MessageId, NackOutcome, OutboundMessage, QueueName, Result, Route,
};
use tracing::warn;

use crate::observability::metrics::SyncMetrics;

/// [`MessageBroker`] delegating to `inner` and recording every publish.
pub struct MeteredBroker {
    inner: Arc<dyn MessageBroker>,
    metrics: Arc<SyncMetrics>,
}

impl MeteredBroker {
    pub fn new(inner: Arc<dyn MessageBroker>, metrics: Arc<SyncMetrics>) -> Self {
        Self { inner, metrics }
    }
}

impl std::fmt::Debug for MeteredBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredBroker").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageBroker for MeteredBroker {
    async fn publish(&self, message: &OutboundMessage) -> Result<MessageId> {
        let queue = message.queue();
        let result = self.inner.publish(message).await;
        if let Err(err) = self.metrics.queue(queue).record_publish(result.is_ok()) {
            warn!(metric = "broker.publish", error = %err, "Failed to record publish metric");
        }
        result
    }

    async fn receive(
        &self,
        queue: QueueName,
        route: Route,
        consumer: &str,
        lease: Duration,
    ) -> Result<Option<Delivery>> {
        self.inner.receive(queue, route, consumer, lease).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner.ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome> {
        self.inner.nack(delivery, reason).await
    }

    async fn dead_letters(&self, queue: QueueName, limit: usize) -> Result<Vec<DeadLetter>> {
        self.inner.dead_letters(queue, limit).await
    }

    async fn replay_dead_letter(&self, id: MessageId) -> Result<bool> {
        self.inner.replay_dead_letter(id).await
    }

    async fn depth(&self, queue: QueueName) -> Result<u64> {
        self.inner.depth(queue).await
    }
}

#[cfg(test)]
mod tests {
    use clinisync_core::testing::InMemoryBroker;
    use clinisync_domain::{DocumentType, UserSyncConfirmation, UserSyncRequest};

    use super::*;

    fn confirmation() -> OutboundMessage {
        let request = UserSyncRequest::new("P-100200", DocumentType::Passport).expect("request");
        OutboundMessage::new(UserSyncConfirmation::success(&request, "corr-1"))
    }

    #[tokio::test]
    async fn counts_successful_publishes() {
        let inner = Arc::new(InMemoryBroker::new());
        let metrics = Arc::new(SyncMetrics::new());
        let broker = MeteredBroker::new(inner.clone(), Arc::clone(&metrics));

        broker.publish(&confirmation()).await.expect("publish");

        let snapshot = metrics.snapshot().queue(QueueName::UserConfirmation);
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.publish_failures, 0);
        assert_eq!(inner.published().await.len(), 1);
    }

    #[tokio::test]
    async fn counts_failed_publishes_and_keeps_the_error() {
        let inner = Arc::new(InMemoryBroker::new().with_fail_publish());
        let metrics = Arc::new(SyncMetrics::new());
        let broker = MeteredBroker::new(inner, Arc::clone(&metrics));

        assert!(broker.publish(&confirmation()).await.is_err());

        let snapshot = metrics.snapshot().queue(QueueName::UserConfirmation);
        assert_eq!(snapshot.published, 0);
        assert_eq!(snapshot.publish_failures, 1);
    }
}
