//! Port interfaces for sync operations
//!
//! These traits define the boundaries between the protocol logic and the
//! broker and storage implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinisync_domain::{
    AuditEvent, AuditStatus, CrossReferenceWrite, DeadLetter, Delivery, DocumentRegistration,
    DocumentSyncRequest, LocalDocument, MessageId, NackOutcome, NewPendingSync, OutboundMessage,
    PatientRegistration, PendingSyncAudit, QueueName, Result, Route, SyncKind, TransitionOutcome,
    UserSyncRequest,
};
use uuid::Uuid;

/// Durable, at-least-once message transport.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Persist a message on the queue matching its kind.
    async fn publish(&self, message: &OutboundMessage) -> Result<MessageId>;

    /// Lease the next visible message on `route`, highest priority then
    /// oldest first.
    ///
    /// The message becomes visible again if the lease expires without an
    /// ack or nack.
    async fn receive(
        &self,
        queue: QueueName,
        route: Route,
        consumer: &str,
        lease: Duration,
    ) -> Result<Option<Delivery>>;

    /// Remove a delivered message.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a message for redelivery, or dead-letter it once the delivery
    /// budget is spent.
    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome>;

    /// Most recent dead letters of a queue.
    async fn dead_letters(&self, queue: QueueName, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Put a dead letter back on its queue with a fresh delivery budget.
    /// Returns `false` when no dead letter has that id.
    async fn replay_dead_letter(&self, id: MessageId) -> Result<bool>;

    /// Messages waiting or in flight on a queue.
    async fn depth(&self, queue: QueueName) -> Result<u64>;
}

/// Peripheral ledger of sync obligations.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert a PENDING row.
    async fn create(&self, new: NewPendingSync) -> Result<PendingSyncAudit>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PendingSyncAudit>>;

    /// Newest open row for the key, else the newest row of any status.
    async fn find_by_subject_and_tenant(
        &self,
        kind: SyncKind,
        subject_id: &str,
        tenant_id: Uuid,
    ) -> Result<Option<PendingSyncAudit>>;

    /// All rows for a subject, newest first.
    async fn find_by_subject(&self, subject_id: &str) -> Result<Vec<PendingSyncAudit>>;

    /// Row created for a document request.
    async fn find_by_document(&self, document_id: Uuid) -> Result<Option<PendingSyncAudit>>;

    /// Rows not updated since `updated_before` that are still worth
    /// resending (see [`PendingSyncAudit::is_resendable`]), oldest first.
    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<PendingSyncAudit>>;

    async fn count_by_tenant_and_status(&self, tenant_id: Uuid, status: AuditStatus)
        -> Result<u64>;

    /// Apply `event` with compare-and-swap on the row version.
    ///
    /// Fails with `NotFound` for an unknown id and with a retryable
    /// `Conflict` when concurrent writers keep winning.
    async fn transition(&self, id: Uuid, event: AuditEvent) -> Result<TransitionOutcome>;

    /// Record a failure on the row for the key. `None` if there is no row.
    async fn record_error(
        &self,
        kind: SyncKind,
        subject_id: &str,
        tenant_id: Uuid,
        message: &str,
    ) -> Result<Option<TransitionOutcome>> {
        match self.find_by_subject_and_tenant(kind, subject_id, tenant_id).await? {
            Some(audit) => self
                .transition(audit.id, AuditEvent::Error { message: message.to_string() })
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Resolve the row for the key. `None` if there is no row.
    async fn mark_resolved(
        &self,
        kind: SyncKind,
        subject_id: &str,
        tenant_id: Uuid,
    ) -> Result<Option<TransitionOutcome>> {
        match self.find_by_subject_and_tenant(kind, subject_id, tenant_id).await? {
            Some(audit) => self.transition(audit.id, AuditEvent::Resolve).await.map(Some),
            None => Ok(None),
        }
    }

    /// Operator action on a row stuck in ERROR.
    async fn mark_cancelled(&self, id: Uuid) -> Result<TransitionOutcome> {
        self.transition(id, AuditEvent::Cancel).await
    }

    /// Touch an open row after reconciliation resent its request.
    async fn record_requeue(&self, id: Uuid) -> Result<TransitionOutcome> {
        self.transition(id, AuditEvent::Requeue).await
    }
}

/// Peripheral clinical documents and their cross references.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserting the same id, tenant and subject again is a no-op; any other
    /// reuse of the id fails with `Validation`.
    async fn insert(&self, document: &LocalDocument) -> Result<()>;

    async fn find(&self, document_id: Uuid) -> Result<Option<LocalDocument>>;

    /// Write the aggregate id only if unset.
    ///
    /// Fails with `NotFound` for an unknown document and with `Security`
    /// when a different aggregate id is already stored.
    async fn set_cross_reference(
        &self,
        document_id: Uuid,
        aggregate_id: Uuid,
    ) -> Result<CrossReferenceWrite>;
}

/// Central per-patient clinical histories.
#[async_trait]
pub trait AggregateRepository: Send + Sync {
    /// Create-or-get the subject's aggregate and link the document to it.
    ///
    /// Idempotent for a repeated request. A document already linked under
    /// another aggregate or tenant is a `Security` error.
    async fn register_document(&self, request: &DocumentSyncRequest)
        -> Result<DocumentRegistration>;

    async fn find_aggregate(&self, subject_id: &str) -> Result<Option<Uuid>>;

    /// Documents linked to an aggregate, in link order.
    async fn linked_documents(&self, aggregate_id: Uuid) -> Result<Vec<Uuid>>;
}

/// Central patient index, deduplicated by subject identifier.
#[async_trait]
pub trait PatientRegistry: Send + Sync {
    /// Registering a known subject is a no-op.
    async fn register(&self, request: &UserSyncRequest) -> Result<PatientRegistration>;

    async fn find_patient(&self, subject_id: &str) -> Result<Option<Uuid>>;
}

/// What the consumer pool should do with a delivery once handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed, remove from the queue.
    Ack,
    /// Transient failure, redeliver.
    Retry { reason: String },
    /// Not processable, remove from the queue.
    Drop { reason: String },
}

impl Disposition {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry { reason: reason.into() }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Drop { reason: reason.into() }
    }

    /// Whether the broker should remove the message.
    pub const fn is_final(&self) -> bool {
        !matches!(self, Self::Retry { .. })
    }
}

/// Consumer of a single queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Name used in logs and consumer ids.
    fn name(&self) -> &'static str;

    fn queue(&self) -> QueueName;

    async fn handle(&self, delivery: &Delivery) -> Disposition;
}
