//! Document sync across peripheral and central nodes.

mod support;

use chrono::Utc;
use clinisync_core::testing::InMemoryBroker;
use clinisync_core::{AggregateRepository, AuditStore, Disposition, MessageBroker, ProcessingStage};
use clinisync_domain::{
    AuditStatus, ClinisyncError, CrossReferenceWrite, Delivery, DocumentSyncConfirmation,
    MessageId, NackOutcome, QueueName, SyncMessage,
};
use support::{drain, settle, tenant, Harness, SUBJECT};
use uuid::Uuid;

fn raw_delivery(queue: QueueName, payload: String) -> Delivery {
    Delivery {
        id: MessageId::new(),
        queue,
        payload,
        priority: 4,
        correlation_id: None,
        delivery_count: 1,
        enqueued_at: Utc::now(),
        lease_token: Uuid::new_v4(),
    }
}

fn published_confirmations(messages: &[clinisync_domain::OutboundMessage]) -> Vec<DocumentSyncConfirmation> {
    messages
        .iter()
        .filter_map(|m| match &m.message {
            SyncMessage::DocumentSyncConfirmation(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_delivery_links_document_once() {
    let h = Harness::new();
    let document_id = Uuid::new_v4();
    h.peripheral.register_document(document_id, SUBJECT).await.expect("register");

    let delivery = h.broker.next_delivery(QueueName::DocumentSync).await.expect("request queued");
    let first = h.document_consumer.process(&delivery).await;
    let second = h.document_consumer.process(&delivery).await;
    h.broker.ack(&delivery).await.expect("ack");

    assert_eq!(first.stage, ProcessingStage::Confirmed);
    assert_eq!(second.stage, ProcessingStage::Confirmed);
    assert_eq!(first.aggregate_id, second.aggregate_id);
    assert_eq!(h.aggregates.link_count().await, 1);

    let aggregate_id = first.aggregate_id.expect("aggregate");
    let linked = h.aggregates.linked_documents(aggregate_id).await.expect("links");
    assert_eq!(linked, vec![document_id]);

    let dispositions = drain(&h.broker, &h.document_confirmations).await;
    assert_eq!(dispositions, vec![Disposition::Ack, Disposition::Ack]);

    let document = h.peripheral.document(document_id).await.expect("find").expect("stored");
    assert_eq!(document.aggregate_id, Some(aggregate_id));

    let audit = h.peripheral.audit_for_document(document_id).await.expect("find").expect("row");
    assert_eq!(audit.status, AuditStatus::Resolved);
    assert_eq!(audit.attempt_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn success_confirmation_correlates_with_request_message() {
    let h = Harness::new();
    let document_id = Uuid::new_v4();
    let message_id = h.peripheral.register_document(document_id, SUBJECT).await.expect("register");

    let delivery = h.broker.next_delivery(QueueName::DocumentSync).await.expect("queued");
    settle(&h.broker, &h.document_consumer, &delivery).await;

    let confirmations = published_confirmations(&h.broker.published().await);
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].correlation_id, message_id.to_string());
    assert_eq!(confirmations[0].document_id, document_id);
    assert_eq!(confirmations[0].tenant_id, tenant());
    assert!(confirmations[0].success);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_tenant_is_dropped_without_redelivery() {
    let h = Harness::new();
    let payload = format!(
        r#"{{"kind":"document_sync_request","documentId":"{}","subjectId":"{SUBJECT}"}}"#,
        Uuid::new_v4()
    );

    let outcome = h.document_consumer.process(&raw_delivery(QueueName::DocumentSync, payload)).await;

    assert_eq!(outcome.stage, ProcessingStage::Received);
    assert!(matches!(outcome.disposition, Disposition::Drop { ref reason } if reason.contains("tenantId")));
    assert_eq!(h.aggregates.link_count().await, 0);
    // Without a tenant there is nowhere to route a failure confirmation.
    assert!(h.broker.published().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_request_with_ids_gets_validation_failure_confirmation() {
    let h = Harness::new();
    let document_id = Uuid::new_v4();
    let payload = format!(
        r#"{{"kind":"document_sync_request","documentId":"{document_id}","tenantId":"{}","subjectId":"  "}}"#,
        tenant()
    );

    let outcome = h.document_consumer.process(&raw_delivery(QueueName::DocumentSync, payload)).await;
    assert!(matches!(outcome.disposition, Disposition::Drop { .. }));

    let confirmations = published_confirmations(&h.broker.published().await);
    assert_eq!(confirmations.len(), 1);
    assert!(!confirmations[0].success);
    assert_eq!(confirmations[0].document_id, document_id);
    let message = confirmations[0].error_message.as_deref().expect("error text");
    assert!(message.starts_with("validation error: "), "got {message}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_payload_is_poison() {
    let h = Harness::new();
    let outcome =
        h.document_consumer.process(&raw_delivery(QueueName::DocumentSync, "{not json".into())).await;

    assert!(matches!(outcome.disposition, Disposition::Drop { .. }));
    assert!(h.broker.published().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failure_records_error_then_resolves_on_redelivery() {
    let h = Harness::new();
    let document_id = Uuid::new_v4();
    h.peripheral.register_document(document_id, SUBJECT).await.expect("register");

    h.aggregates.set_failing(true);
    let delivery = h.broker.next_delivery(QueueName::DocumentSync).await.expect("queued");
    let (disposition, nack) = settle(&h.broker, &h.document_consumer, &delivery).await;
    assert!(matches!(disposition, Disposition::Retry { .. }));
    assert_eq!(nack, Some(NackOutcome::Requeued { delivery_count: 1 }));

    drain(&h.broker, &h.document_confirmations).await;
    let audit = h.peripheral.audit_for_document(document_id).await.expect("find").expect("row");
    assert_eq!(audit.status, AuditStatus::Error);
    assert_eq!(audit.attempt_count, 1);
    assert!(audit.last_error.as_deref().unwrap_or_default().starts_with("transient error: "));

    h.aggregates.set_failing(false);
    let redelivery = h.broker.next_delivery(QueueName::DocumentSync).await.expect("redelivered");
    assert!(redelivery.is_redelivery());
    let (disposition, _) = settle(&h.broker, &h.document_consumer, &redelivery).await;
    assert_eq!(disposition, Disposition::Ack);

    drain(&h.broker, &h.document_confirmations).await;
    let audit = h.peripheral.audit_for_document(document_id).await.expect("find").expect("row");
    assert_eq!(audit.status, AuditStatus::Resolved);
    assert_eq!(audit.attempt_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_redeliveries_are_dead_lettered_and_replayable() {
    let h = Harness::with_broker(InMemoryBroker::new().with_max_deliveries(3));
    h.peripheral.register_document(Uuid::new_v4(), SUBJECT).await.expect("register");
    h.aggregates.set_failing(true);

    let dispositions = drain(&h.broker, &h.document_consumer).await;
    assert_eq!(dispositions.len(), 3);
    assert!(dispositions.iter().all(|d| !d.is_final()));

    let dead = h.broker.dead_letters(QueueName::DocumentSync, 10).await.expect("dead letters");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].delivery_count, 3);
    assert_eq!(h.broker.depth(QueueName::DocumentSync).await.expect("depth"), 0);

    h.aggregates.set_failing(false);
    assert!(h.broker.replay_dead_letter(dead[0].id).await.expect("replay"));
    assert_eq!(drain(&h.broker, &h.document_consumer).await, vec![Disposition::Ack]);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_confirmation_send_still_acknowledges() {
    let h = Harness::new();
    h.peripheral.register_document(Uuid::new_v4(), SUBJECT).await.expect("register");
    let delivery = h.broker.next_delivery(QueueName::DocumentSync).await.expect("queued");

    h.broker.set_fail_publish(true);
    let outcome = h.document_consumer.process(&delivery).await;

    assert_eq!(outcome.stage, ProcessingStage::Applied);
    assert_eq!(outcome.disposition, Disposition::Ack);
    assert_eq!(h.aggregates.link_count().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn tenant_mismatch_is_security_error() {
    let h = Harness::new();
    let document_id = Uuid::new_v4();
    h.peripheral.register_document(document_id, SUBJECT).await.expect("register");

    let mut confirmation = DocumentSyncConfirmation::failure(
        document_id,
        tenant(),
        SUBJECT,
        "placeholder",
        "corr",
    );
    confirmation.success = true;
    confirmation.error_message = None;
    confirmation.aggregate_id = Some(Uuid::new_v4());
    confirmation.tenant_id = Uuid::new_v4();

    let err = h.document_confirmations.apply(&confirmation).await.expect_err("foreign tenant");
    assert!(matches!(err, ClinisyncError::Security(_)));

    let document = h.peripheral.document(document_id).await.expect("find").expect("stored");
    assert_eq!(document.aggregate_id, None);
    let audit = h.peripheral.audit_for_document(document_id).await.expect("find").expect("row");
    assert_eq!(audit.status, AuditStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_aggregate_never_overwrites_cross_reference() {
    let h = Harness::new();
    let document_id = Uuid::new_v4();
    h.peripheral.register_document(document_id, SUBJECT).await.expect("register");

    let request = clinisync_domain::DocumentSyncRequest::new(document_id, SUBJECT, tenant())
        .expect("request");
    let first = Uuid::new_v4();
    let report = h
        .document_confirmations
        .apply(&DocumentSyncConfirmation::success(&request, first, "c1"))
        .await
        .expect("first confirmation");
    assert_eq!(report.cross_reference, Some(CrossReferenceWrite::Set));

    let again = h
        .document_confirmations
        .apply(&DocumentSyncConfirmation::success(&request, first, "c1"))
        .await
        .expect("same aggregate again");
    assert_eq!(again.cross_reference, Some(CrossReferenceWrite::AlreadySet));

    let err = h
        .document_confirmations
        .apply(&DocumentSyncConfirmation::success(&request, Uuid::new_v4(), "c2"))
        .await
        .expect_err("conflicting aggregate");
    assert!(matches!(err, ClinisyncError::Security(_)));

    let document = h.peripheral.document(document_id).await.expect("find").expect("stored");
    assert_eq!(document.aggregate_id, Some(first));
}

#[tokio::test(flavor = "multi_thread")]
async fn confirmation_for_unknown_records_is_acknowledged() {
    let h = Harness::new();
    let request =
        clinisync_domain::DocumentSyncRequest::new(Uuid::new_v4(), SUBJECT, tenant()).expect("ok");
    let confirmation = DocumentSyncConfirmation::success(&request, Uuid::new_v4(), "c");
    let payload = SyncMessage::from(confirmation).to_json().expect("encode");

    let disposition = clinisync_core::MessageHandler::handle(
        &h.document_confirmations,
        &raw_delivery(QueueName::DocumentConfirmation, payload),
    )
    .await;
    assert_eq!(disposition, Disposition::Ack);
}

#[tokio::test(flavor = "multi_thread")]
async fn enqueue_failure_keeps_pending_row() {
    let h = Harness::with_broker(InMemoryBroker::new().with_fail_publish());
    let document_id = Uuid::new_v4();

    let err = h
        .peripheral
        .register_document(document_id, SUBJECT)
        .await
        .expect_err("broker down");
    assert!(matches!(err, ClinisyncError::Transport(_)));

    let audit = h.audits.find_by_document(document_id).await.expect("find").expect("row");
    assert_eq!(audit.status, AuditStatus::Pending);
    assert!(h.peripheral.document(document_id).await.expect("find").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_ledger_write_can_be_retried() {
    let h = Harness::new();
    h.audits.set_fail_writes(true);
    let document_id = Uuid::new_v4();

    let err = h
        .peripheral
        .register_document(document_id, SUBJECT)
        .await
        .expect_err("ledger down");
    assert!(matches!(err, ClinisyncError::Database(_)));
    assert!(h.broker.published().await.is_empty());

    h.audits.set_fail_writes(false);
    h.peripheral.register_document(document_id, SUBJECT).await.expect("retry succeeds");

    let rows = h.audits.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].document_id, Some(document_id));
    assert_eq!(rows[0].status, AuditStatus::Pending);
    assert_eq!(h.broker.published().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_after_enqueue_failure_reuses_ledger_row() {
    let h = Harness::with_broker(InMemoryBroker::new().with_fail_publish());
    let document_id = Uuid::new_v4();
    h.peripheral.register_document(document_id, SUBJECT).await.expect_err("broker down");

    h.broker.set_fail_publish(false);
    h.peripheral.register_document(document_id, SUBJECT).await.expect("retry succeeds");

    assert_eq!(h.audits.all().await.len(), 1);
    assert_eq!(h.broker.published().await.len(), 1);

    let err = h
        .peripheral
        .register_document(document_id, "another-subject")
        .await
        .expect_err("document id reused for another subject");
    assert!(matches!(err, ClinisyncError::Validation(_)));
}
