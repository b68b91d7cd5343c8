//! Patient registration sync.

mod support;

use std::time::Duration;

use chrono::Utc;
use clinisync_core::{AuditStore, Disposition, MessageHandler, PatientRegistry};
use clinisync_domain::{
    AuditStatus, Delivery, DocumentType, MessageId, NewPendingSync, QueueName, SyncKind,
    SyncMessage, TransitionOutcome, UserSyncConfirmation, UserSyncDraft, UserSyncRequest,
};
use support::{drain, tenant, Harness};
use uuid::Uuid;

const PATIENT: &str = "4.567.890-1";

fn patient_request() -> UserSyncRequest {
    UserSyncRequest::new(PATIENT, DocumentType::NationalId).expect("valid request")
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_round_trip_resolves_exact_row() {
    let h = Harness::new();
    h.peripheral.register_patient(patient_request()).await.expect("register");

    assert_eq!(drain(&h.broker, &h.user_consumer).await, vec![Disposition::Ack]);
    assert!(h.patients.find_patient(PATIENT).await.expect("find").is_some());

    let published = h.broker.published().await;
    let echoed = published.iter().find_map(|m| match &m.message {
        SyncMessage::UserSyncConfirmation(c) => Some(c.clone()),
        _ => None,
    });
    assert_eq!(echoed.expect("confirmation").tenant_id, Some(tenant()));

    assert_eq!(drain(&h.broker, &h.user_confirmations).await, vec![Disposition::Ack]);
    let row = h
        .audits
        .find_by_subject_and_tenant(SyncKind::User, PATIENT, tenant())
        .await
        .expect("find")
        .expect("row");
    assert_eq!(row.status, AuditStatus::Resolved);
}

#[tokio::test(flavor = "multi_thread")]
async fn registering_known_subject_is_noop() {
    let h = Harness::new();
    h.peripheral.register_patient(patient_request()).await.expect("first");
    h.peripheral.register_patient(patient_request()).await.expect("second");

    let dispositions = drain(&h.broker, &h.user_consumer).await;
    assert_eq!(dispositions, vec![Disposition::Ack, Disposition::Ack]);
    assert_eq!(h.patients.count().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn confirmation_without_tenant_picks_most_recent_open_row() {
    let h = Harness::new();
    let older_tenant = Uuid::new_v4();
    let older = h
        .audits
        .create(NewPendingSync::for_user(&patient_request(), older_tenant))
        .await
        .expect("older");
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = h
        .audits
        .create(NewPendingSync::for_user(&patient_request(), tenant()))
        .await
        .expect("newer");

    let confirmation = UserSyncConfirmation::failure(PATIENT, None, "transient error: busy", "c1");
    let outcome = h.user_confirmations.apply(&confirmation).await.expect("apply").expect("row");
    assert_eq!(outcome.audit().id, newer.id);
    assert_eq!(outcome.audit().status, AuditStatus::Error);

    let exact = UserSyncConfirmation {
        tenant_id: Some(older_tenant),
        ..UserSyncConfirmation::failure(PATIENT, None, "validation error: bad", "c2")
    };
    let outcome = h.user_confirmations.apply(&exact).await.expect("apply").expect("row");
    assert_eq!(outcome.audit().id, older.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_success_confirmation_is_unchanged() {
    let h = Harness::new();
    h.peripheral.register_patient(patient_request()).await.expect("register");
    let request = patient_request().with_tenant(tenant());
    let confirmation = UserSyncConfirmation::success(&request, "c1");

    let first = h.user_confirmations.apply(&confirmation).await.expect("apply").expect("row");
    let second = h.user_confirmations.apply(&confirmation).await.expect("apply").expect("row");

    assert!(first.is_applied());
    assert!(matches!(second, TransitionOutcome::Unchanged(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_document_type_gets_validation_failure() {
    let h = Harness::new();
    let payload = format!(
        r#"{{"kind":"user_sync_request","subjectId":"{PATIENT}","documentType":"LICENCIA","tenantId":"{}"}}"#,
        tenant()
    );
    let delivery = Delivery {
        id: MessageId::new(),
        queue: QueueName::UserSync,
        payload,
        priority: 4,
        correlation_id: None,
        delivery_count: 1,
        enqueued_at: Utc::now(),
        lease_token: Uuid::new_v4(),
    };

    let disposition = h.user_consumer.handle(&delivery).await;
    assert!(matches!(disposition, Disposition::Drop { .. }));
    assert_eq!(h.patients.count().await, 0);

    let published = h.broker.published().await;
    let SyncMessage::UserSyncConfirmation(confirmation) = &published[0].message else {
        panic!("expected a user confirmation");
    };
    assert!(!confirmation.success);
    assert_eq!(confirmation.tenant_id, Some(tenant()));
    assert!(confirmation.error_message.as_deref().unwrap_or_default().starts_with("validation error: "));
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_skips_invalid_entries() {
    let h = Harness::new();
    let producer = clinisync_core::UserSyncProducer::new(h.broker.clone());
    let drafts = vec![
        UserSyncDraft { subject_id: Some("1".into()), document_type: Some("XX".into()), ..Default::default() },
        UserSyncDraft { subject_id: Some("2".into()), document_type: Some("PA".into()), ..Default::default() },
        UserSyncDraft { subject_id: Some("3".into()), document_type: Some("CI".into()), ..Default::default() },
    ];

    assert_eq!(producer.enqueue_many(&drafts).await, 2);
}
