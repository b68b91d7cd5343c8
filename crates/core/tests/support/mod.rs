//! Shared wiring for `clinisync-core` integration tests.
//!
//! One in-memory broker connects a peripheral clinic and the central
//! aggregator, so a test can drive both sides of the protocol.

#![allow(dead_code)]

use std::sync::Arc;

use clinisync_core::testing::{
    InMemoryAggregateRepository, InMemoryAuditStore, InMemoryBroker, InMemoryDocumentStore,
    InMemoryPatientRegistry,
};
use clinisync_core::{
    ConfirmationProducer, Disposition, DocumentConfirmationConsumer, DocumentSyncConsumer,
    MessageBroker, MessageHandler, PeripheralSyncService, UserConfirmationConsumer,
    UserSyncConsumer,
};
use clinisync_domain::{Delivery, NackOutcome};
use uuid::Uuid;

pub const SUBJECT: &str = "12345678";

pub fn tenant() -> Uuid {
    Uuid::parse_str("0b8d3c3e-52a4-4c36-9a43-6f3a4c0e2a11").expect("uuid")
}

pub struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub audits: Arc<InMemoryAuditStore>,
    pub documents: Arc<InMemoryDocumentStore>,
    pub aggregates: Arc<InMemoryAggregateRepository>,
    pub patients: Arc<InMemoryPatientRegistry>,
    pub peripheral: PeripheralSyncService,
    pub document_consumer: DocumentSyncConsumer,
    pub document_confirmations: DocumentConfirmationConsumer,
    pub user_consumer: UserSyncConsumer,
    pub user_confirmations: UserConfirmationConsumer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_broker(InMemoryBroker::new())
    }

    pub fn with_broker(broker: InMemoryBroker) -> Self {
        let broker = Arc::new(broker);
        let audits = Arc::new(InMemoryAuditStore::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let aggregates = Arc::new(InMemoryAggregateRepository::new());
        let patients = Arc::new(InMemoryPatientRegistry::new());
        let confirmations = ConfirmationProducer::new(broker.clone());

        Self {
            peripheral: PeripheralSyncService::new(
                tenant(),
                documents.clone(),
                audits.clone(),
                broker.clone(),
            ),
            document_consumer: DocumentSyncConsumer::new(aggregates.clone(), confirmations.clone()),
            document_confirmations: DocumentConfirmationConsumer::new(
                documents.clone(),
                audits.clone(),
            ),
            user_consumer: UserSyncConsumer::new(patients.clone(), confirmations),
            user_confirmations: UserConfirmationConsumer::new(audits.clone()),
            broker,
            audits,
            documents,
            aggregates,
            patients,
        }
    }
}

/// Feed one delivery to `handler` and settle it with the broker the way
/// the consumer pool does.
pub async fn settle(
    broker: &InMemoryBroker,
    handler: &dyn MessageHandler,
    delivery: &Delivery,
) -> (Disposition, Option<NackOutcome>) {
    let disposition = handler.handle(delivery).await;
    let nack = match &disposition {
        Disposition::Ack | Disposition::Drop { .. } => {
            broker.ack(delivery).await.expect("ack");
            None
        }
        Disposition::Retry { reason } => Some(broker.nack(delivery, reason).await.expect("nack")),
    };
    (disposition, nack)
}

/// Deliver everything on the handler's queue until it is empty.
pub async fn drain(broker: &InMemoryBroker, handler: &dyn MessageHandler) -> Vec<Disposition> {
    let mut dispositions = Vec::new();
    while let Some(delivery) = broker.next_delivery(handler.queue()).await {
        let (disposition, _) = settle(broker, handler, &delivery).await;
        dispositions.push(disposition);
    }
    dispositions
}
