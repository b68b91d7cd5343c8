//! Ledger lifecycle and reconciliation.

mod support;

use std::time::Duration;

use clinisync_core::{AuditStore, MessageBroker, ReconciliationService};
use clinisync_domain::{
    AuditEvent, AuditStatus, DocumentSyncRequest, NewPendingSync, QueueName, SyncKind,
    TransitionOutcome,
};
use support::{tenant, Harness, SUBJECT};
use uuid::Uuid;

fn document_row() -> NewPendingSync {
    let request = DocumentSyncRequest::new(Uuid::new_v4(), SUBJECT, tenant()).expect("valid");
    NewPendingSync::for_document(&request)
}

#[tokio::test(flavor = "multi_thread")]
async fn error_error_resolve_counts_attempts() {
    let h = Harness::new();
    h.audits.create(document_row()).await.expect("create");

    for message in ["first", "second"] {
        h.audits
            .record_error(SyncKind::Document, SUBJECT, tenant(), message)
            .await
            .expect("record")
            .expect("row exists");
    }
    let outcome = h
        .audits
        .mark_resolved(SyncKind::Document, SUBJECT, tenant())
        .await
        .expect("resolve")
        .expect("row exists");

    let row = outcome.audit();
    assert_eq!(row.status, AuditStatus::Resolved);
    assert_eq!(row.attempt_count, 2);
    assert_eq!(row.last_error.as_deref(), Some("second"));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_key_is_none() {
    let h = Harness::new();
    let outcome = h
        .audits
        .record_error(SyncKind::Document, "nobody", tenant(), "x")
        .await
        .expect("lookup");
    assert!(outcome.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_cancels_only_errored_rows() {
    let h = Harness::new();
    let row = h.audits.create(document_row()).await.expect("create");

    let rejected = h.peripheral.cancel(row.id).await.expect("cancel pending");
    assert!(matches!(rejected, TransitionOutcome::Rejected { .. }));

    h.audits
        .record_error(SyncKind::Document, SUBJECT, tenant(), "boom")
        .await
        .expect("record");
    let cancelled = h.peripheral.cancel(row.id).await.expect("cancel errored");
    assert_eq!(cancelled.audit().status, AuditStatus::Cancelled);

    let errors = h.audits.count_by_tenant_and_status(tenant(), AuditStatus::Cancelled).await;
    assert_eq!(errors.expect("count"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_resends_only_stale_open_rows() {
    let h = Harness::new();
    let stale = h.audits.create(document_row()).await.expect("stale");
    let fresh = h.audits.create(document_row()).await.expect("fresh");
    let closed = h.audits.create(document_row()).await.expect("closed");
    h.audits.transition(closed.id, AuditEvent::Resolve).await.expect("resolve");

    h.audits.backdate(stale.id, chrono::Duration::hours(2)).await;
    h.audits.backdate(closed.id, chrono::Duration::hours(2)).await;

    let service = ReconciliationService::new(
        h.audits.clone(),
        h.broker.clone(),
        Duration::from_secs(3600),
        100,
    );
    let report = service.run_once().await.expect("reconcile");

    assert_eq!(report.scanned, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(h.broker.depth(QueueName::DocumentSync).await.expect("depth"), 1);

    let touched = h.audits.find_by_id(stale.id).await.expect("find").expect("row");
    assert_eq!(touched.status, AuditStatus::Pending);
    assert_eq!(touched.version, 1);

    let untouched = h.audits.find_by_id(fresh.id).await.expect("find").expect("row");
    assert_eq!(untouched.version, 0);

    // A second pass finds nothing: the resend refreshed the row.
    let report = service.run_once().await.expect("reconcile again");
    assert_eq!(report.scanned, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_counts_send_failures() {
    let h = Harness::new();
    let row = h.audits.create(document_row()).await.expect("create");
    h.audits.backdate(row.id, chrono::Duration::hours(2)).await;
    h.broker.set_fail_publish(true);

    let service =
        ReconciliationService::new(h.audits.clone(), h.broker.clone(), Duration::from_secs(60), 10);
    let report = service.run_once().await.expect("reconcile");

    assert_eq!(report.failed, 1);
    let row = h.audits.find_by_id(row.id).await.expect("find").expect("row");
    assert_eq!(row.version, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_leaves_rejected_and_exhausted_rows() {
    let h = Harness::new();
    let retryable = h.audits.create(document_row()).await.expect("retryable");
    let exhausted = h.audits.create(document_row()).await.expect("exhausted");
    let invalid = h.audits.create(document_row()).await.expect("invalid");
    let forbidden = h.audits.create(document_row()).await.expect("forbidden");

    let failures = [
        (retryable.id, "transient error: locked"),
        (exhausted.id, "transient error: locked"),
        (exhausted.id, "transient error: locked"),
        (invalid.id, "validation error: missing tenantId"),
        (forbidden.id, "security error: confirmation tenant does not own audit row"),
    ];
    for (id, message) in failures {
        h.audits
            .transition(id, AuditEvent::Error { message: message.into() })
            .await
            .expect("record failure");
    }
    for id in [retryable.id, exhausted.id, invalid.id, forbidden.id] {
        h.audits.backdate(id, chrono::Duration::hours(2)).await;
    }

    let service =
        ReconciliationService::new(h.audits.clone(), h.broker.clone(), Duration::from_secs(60), 10)
            .with_max_attempts(2);
    let report = service.run_once().await.expect("reconcile");

    assert_eq!(report.scanned, 1);
    assert_eq!(report.requeued, 1);
    let published = h.broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message, retryable.request);

    for id in [exhausted.id, invalid.id, forbidden.id] {
        let row = h.audits.find_by_id(id).await.expect("find").expect("row");
        assert_eq!(row.status, AuditStatus::Error);
    }
}
