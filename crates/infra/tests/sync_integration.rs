//! End-to-end sync between a clinic node and the central node.
//!
//! Both sides run against real SQLCipher databases and share one broker
//! database, the way separately deployed nodes do.

mod support;

use std::time::Duration;

use clinisync_core::{
    AggregateRepository, AuditStore, DocumentStore, DocumentSyncProducer, MessageBroker,
    PatientRegistry, ReconciliationService,
};
use clinisync_domain::{
    AuditStatus, DocumentType, LocalDocument, NewPendingSync, QueueName, SyncKind,
    UserSyncRequest,
};
use support::{eventually, SyncHarness};
use uuid::Uuid;

async fn audit_status(harness: &SyncHarness, document_id: Uuid) -> Option<AuditStatus> {
    harness
        .audits
        .find_by_document(document_id)
        .await
        .expect("audit lookup")
        .map(|audit| audit.status)
}

async fn queues_drained(harness: &SyncHarness) -> bool {
    for queue in QueueName::ALL {
        if harness.broker.depth(queue).await.expect("depth") > 0 {
            return false;
        }
    }
    true
}

#[tokio::test(flavor = "multi_thread")]
async fn document_is_linked_and_confirmed() {
    let harness = SyncHarness::new();
    let mut central = harness.central_pool();
    let mut clinic = harness.clinic_pool();
    central.start().await.expect("central consumers start");
    clinic.start().await.expect("clinic consumers start");

    let document_id = Uuid::now_v7();
    harness.peripheral.register_document(document_id, "4.123.456-7").await.expect("register");

    let h = &harness;
    eventually(move || async move {
        audit_status(h, document_id).await == Some(AuditStatus::Resolved)
    })
    .await;
    eventually(move || queues_drained(h)).await;

    central.stop().await.expect("central stop");
    clinic.stop().await.expect("clinic stop");

    let aggregate_id = harness
        .aggregates
        .find_aggregate("4.123.456-7")
        .await
        .expect("aggregate lookup")
        .expect("aggregate created");
    let document = harness.documents.find(document_id).await.expect("find").expect("document");
    assert_eq!(document.aggregate_id, Some(aggregate_id));
    assert_eq!(
        harness.aggregates.linked_documents(aggregate_id).await.expect("links"),
        vec![document_id]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_requests_link_once() {
    let harness = SyncHarness::new();
    let document_id = Uuid::now_v7();
    harness.peripheral.register_document(document_id, "subject-dup").await.expect("register");

    // At-least-once delivery: the same request arrives a second time.
    let request = LocalDocument::new(document_id, harness.tenant_id, "subject-dup")
        .sync_request()
        .expect("request");
    DocumentSyncProducer::new(harness.broker.clone())
        .enqueue_request(&request)
        .await
        .expect("duplicate enqueue");
    assert_eq!(harness.broker.depth(QueueName::DocumentSync).await.expect("depth"), 2);

    let mut central = harness.central_pool();
    let mut clinic = harness.clinic_pool();
    central.start().await.expect("central consumers start");
    clinic.start().await.expect("clinic consumers start");

    let h = &harness;
    eventually(move || queues_drained(h)).await;
    central.stop().await.expect("central stop");
    clinic.stop().await.expect("clinic stop");

    let aggregate_id = harness
        .aggregates
        .find_aggregate("subject-dup")
        .await
        .expect("aggregate lookup")
        .expect("aggregate created");
    assert_eq!(harness.aggregates.linked_documents(aggregate_id).await.expect("links").len(), 1);
    assert_eq!(audit_status(&harness, document_id).await, Some(AuditStatus::Resolved));
    assert!(harness.broker.dead_letters(QueueName::DocumentSync, 10).await.expect("dlq").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn patient_is_registered_and_confirmed() {
    let harness = SyncHarness::new();
    let mut central = harness.central_pool();
    let mut clinic = harness.clinic_pool();
    central.start().await.expect("central consumers start");
    clinic.start().await.expect("clinic consumers start");

    let request = UserSyncRequest::new("P-998877", DocumentType::Passport).expect("request");
    harness.peripheral.register_patient(request).await.expect("register patient");

    let h = &harness;
    eventually(move || async move {
        h.audits
            .find_by_subject_and_tenant(SyncKind::User, "P-998877", h.tenant_id)
            .await
            .expect("audit lookup")
            .is_some_and(|audit| audit.status == AuditStatus::Resolved)
    })
    .await;
    central.stop().await.expect("central stop");
    clinic.stop().await.expect("clinic stop");

    assert!(harness.patients.find_patient("P-998877").await.expect("lookup").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_resends_lost_requests() {
    let harness = SyncHarness::new();

    // Stored and recorded, but the send never reached the broker.
    let document = LocalDocument::new(Uuid::now_v7(), harness.tenant_id, "subject-lost");
    let request = document.sync_request().expect("request");
    harness.documents.insert(&document).await.expect("insert document");
    harness.audits.create(NewPendingSync::for_document(&request)).await.expect("audit row");
    assert_eq!(harness.broker.depth(QueueName::DocumentSync).await.expect("depth"), 0);

    let reconciliation = ReconciliationService::new(
        harness.audits.clone(),
        harness.broker.clone(),
        Duration::from_secs(60),
        10,
    );
    let report = reconciliation.run_once().await.expect("fresh rows are skipped");
    assert_eq!(report.scanned, 0);

    harness.backdate_audits(Duration::from_secs(3_600));
    let report = reconciliation.run_once().await.expect("stale rows are resent");
    assert_eq!(report.requeued, 1);
    assert_eq!(harness.broker.depth(QueueName::DocumentSync).await.expect("depth"), 1);

    let mut central = harness.central_pool();
    let mut clinic = harness.clinic_pool();
    central.start().await.expect("central consumers start");
    clinic.start().await.expect("clinic consumers start");

    let (h, document_id) = (&harness, document.id);
    eventually(move || async move {
        audit_status(h, document_id).await == Some(AuditStatus::Resolved)
    })
    .await;
    central.stop().await.expect("central stop");
    clinic.stop().await.expect("clinic stop");

    let stored = harness.documents.find(document.id).await.expect("find").expect("document");
    assert!(stored.aggregate_id.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn central_rejects_document_moved_between_tenants() {
    let harness = SyncHarness::new();
    let document_id = Uuid::now_v7();
    let first = LocalDocument::new(document_id, harness.tenant_id, "subject-x")
        .sync_request()
        .expect("request");
    harness.aggregates.register_document(&first).await.expect("first link");

    let hijack = LocalDocument::new(document_id, Uuid::now_v7(), "subject-x")
        .sync_request()
        .expect("request");
    let err = harness.aggregates.register_document(&hijack).await.expect_err("rejected");
    assert!(matches!(err, clinisync_domain::ClinisyncError::Security(_)));

    let aggregate_id = harness
        .aggregates
        .find_aggregate("subject-x")
        .await
        .expect("lookup")
        .expect("aggregate");
    assert_eq!(
        harness.aggregates.linked_documents(aggregate_id).await.expect("links"),
        vec![document_id]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn confirmations_reach_only_the_originating_clinic() {
    let harness = SyncHarness::new();
    let other_clinic = harness.open_clinic("clinic-b");

    let document_id = Uuid::now_v7();
    harness.peripheral.register_document(document_id, "subject-a").await.expect("register");

    // Central answers while only the other clinic is consuming confirmations.
    let mut central = harness.central_pool();
    let mut other_pool = other_clinic.pool();
    central.start().await.expect("central consumers start");
    other_pool.start().await.expect("other clinic consumers start");

    let h = &harness;
    eventually(move || async move {
        h.broker.depth(QueueName::DocumentSync).await.expect("depth") == 0
            && h.broker.depth(QueueName::DocumentConfirmation).await.expect("depth") == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.broker.depth(QueueName::DocumentConfirmation).await.expect("depth"), 1);
    assert_eq!(audit_status(&harness, document_id).await, Some(AuditStatus::Pending));

    // The other clinic still gets its own confirmations.
    let other_document = Uuid::now_v7();
    other_clinic.peripheral.register_document(other_document, "subject-b").await.expect("register");
    let other = &other_clinic;
    eventually(move || async move {
        other
            .audits
            .find_by_document(other_document)
            .await
            .expect("audit lookup")
            .is_some_and(|audit| audit.status == AuditStatus::Resolved)
    })
    .await;

    let mut clinic = harness.clinic_pool();
    clinic.start().await.expect("clinic consumers start");
    eventually(move || async move {
        audit_status(h, document_id).await == Some(AuditStatus::Resolved)
    })
    .await;

    central.stop().await.expect("central stop");
    other_pool.stop().await.expect("other clinic stop");
    clinic.stop().await.expect("clinic stop");

    let document = harness.documents.find(document_id).await.expect("find").expect("document");
    assert!(document.aggregate_id.is_some());
    assert!(other_clinic.documents.find(document_id).await.expect("find").is_none());
}
