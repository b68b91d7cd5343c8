//! In-memory port implementations for tests.
//!
//! Leases never expire here; tests that need expiry use the SQLite broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinisync_domain::constants::DEFAULT_MAX_DELIVERIES;
use clinisync_domain::{
    AuditEvent, AuditStatus, ClinisyncError, CrossReferenceWrite, DeadLetter, Delivery,
    DocumentRegistration, DocumentSyncRequest, LocalDocument, MessageId, NackOutcome,
    NewPendingSync, OutboundMessage, PatientRegistration, PendingSyncAudit, QueueName, Result,
    Route, SyncKind, TransitionOutcome, UserSyncRequest,
};
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use crate::sync::ports::{
    AggregateRepository, AuditStore, DocumentStore, MessageBroker, PatientRegistry,
};

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    queue: QueueName,
    address: Option<Uuid>,
    payload: String,
    priority: u8,
    correlation_id: Option<String>,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
    lease_token: Option<Uuid>,
}

impl StoredMessage {
    fn to_delivery(&self, lease_token: Uuid) -> Delivery {
        Delivery {
            id: self.id,
            queue: self.queue,
            payload: self.payload.clone(),
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
            lease_token,
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    messages: Vec<StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    published: Vec<OutboundMessage>,
}

/// Broker keeping every queue in memory.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<TokioMutex<BrokerState>>,
    fail_publish: Arc<AtomicBool>,
    max_deliveries: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TokioMutex::new(BrokerState::default())),
            fail_publish: Arc::new(AtomicBool::new(false)),
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Every publish fails with a transport error.
    pub fn with_fail_publish(self) -> Self {
        self.fail_publish.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Everything successfully published so far, in order.
    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.published.clone()
    }

    /// Lease the next message of `queue` for a test consumer.
    pub async fn next_delivery(&self, queue: QueueName) -> Option<Delivery> {
        self.next_delivery_on(queue, Route::Any).await
    }

    /// Lease the next message of `queue` visible on `route`.
    pub async fn next_delivery_on(&self, queue: QueueName, route: Route) -> Option<Delivery> {
        self.receive(queue, route, "test", Duration::from_secs(30)).await.ok().flatten()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: &OutboundMessage) -> Result<MessageId> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ClinisyncError::Transport("broker unavailable".into()));
        }
        let payload = message.message.to_json()?;
        let id = MessageId::new();

        let mut state = self.state.lock().await;
        state.messages.push(StoredMessage {
            id,
            queue: message.queue(),
            address: message.address(),
            payload,
            priority: message.priority,
            correlation_id: message.correlation_id.clone(),
            delivery_count: 0,
            enqueued_at: Utc::now(),
            lease_token: None,
        });
        state.published.push(message.clone());
        Ok(id)
    }

    async fn receive(
        &self,
        queue: QueueName,
        route: Route,
        _consumer: &str,
        _lease: Duration,
    ) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let next = state
            .messages
            .iter_mut()
            .filter(|m| m.queue == queue && m.lease_token.is_none() && route.accepts(m.address))
            .min_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));

        Ok(next.map(|message| {
            let token = Uuid::new_v4();
            message.delivery_count += 1;
            message.lease_token = Some(token);
            message.to_delivery(token)
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .messages
            .retain(|m| !(m.id == delivery.id && m.lease_token == Some(delivery.lease_token)));
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> Result<NackOutcome> {
        let mut state = self.state.lock().await;
        let Some(index) = state
            .messages
            .iter()
            .position(|m| m.id == delivery.id && m.lease_token == Some(delivery.lease_token))
        else {
            return Ok(NackOutcome::LeaseLost);
        };

        if state.messages[index].delivery_count >= self.max_deliveries {
            let message = state.messages.remove(index);
            state.dead_letters.push(DeadLetter {
                id: message.id,
                queue: message.queue,
                address: message.address,
                payload: message.payload,
                priority: message.priority,
                correlation_id: message.correlation_id,
                delivery_count: message.delivery_count,
                enqueued_at: message.enqueued_at,
                dead_lettered_at: Utc::now(),
                last_error: Some(reason.to_string()),
            });
            return Ok(NackOutcome::DeadLettered);
        }

        let message = &mut state.messages[index];
        message.lease_token = None;
        Ok(NackOutcome::Requeued { delivery_count: message.delivery_count })
    }

    async fn dead_letters(&self, queue: QueueName, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.iter().rev().filter(|d| d.queue == queue).take(limit).cloned().collect())
    }

    async fn replay_dead_letter(&self, id: MessageId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(index) = state.dead_letters.iter().position(|d| d.id == id) else {
            return Ok(false);
        };
        let dead = state.dead_letters.remove(index);
        state.messages.push(StoredMessage {
            id: dead.id,
            queue: dead.queue,
            address: dead.address,
            payload: dead.payload,
            priority: dead.priority,
            correlation_id: dead.correlation_id,
            delivery_count: 0,
            enqueued_at: Utc::now(),
            lease_token: None,
        });
        Ok(true)
    }

    async fn depth(&self, queue: QueueName) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.messages.iter().filter(|m| m.queue == queue).count() as u64)
    }
}

// ============================================================================
// Audit store
// ============================================================================

/// Ledger kept in a map; applies the same state machine as the SQL store.
#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    rows: Arc<TokioMutex<HashMap<Uuid, PendingSyncAudit>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with a database error.
    pub fn with_fail_writes(self) -> Self {
        self.fail_writes.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<PendingSyncAudit> {
        let mut rows: Vec<_> = self.rows.lock().await.values().cloned().collect();
        rows.sort_by_key(|row| row.created_at);
        rows
    }

    /// Move a row's `updated_at` into the past.
    pub async fn backdate(&self, id: Uuid, by: chrono::Duration) {
        if let Some(row) = self.rows.lock().await.get_mut(&id) {
            row.updated_at -= by;
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ClinisyncError::Database("audit store unavailable".into()));
        }
        Ok(())
    }
}

fn newest_first(rows: &mut [PendingSyncAudit]) {
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create(&self, new: NewPendingSync) -> Result<PendingSyncAudit> {
        self.check_writable()?;
        let row = PendingSyncAudit::new(new, Utc::now());
        self.rows.lock().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PendingSyncAudit>> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn find_by_subject_and_tenant(
        &self,
        kind: SyncKind,
        subject_id: &str,
        tenant_id: Uuid,
    ) -> Result<Option<PendingSyncAudit>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|r| r.kind == kind && r.subject_id == subject_id && r.tenant_id == tenant_id)
            .cloned()
            .collect();
        newest_first(&mut rows);
        let open = rows.iter().position(PendingSyncAudit::is_open);
        Ok(match open {
            Some(index) => Some(rows.swap_remove(index)),
            None => rows.into_iter().next(),
        })
    }

    async fn find_by_subject(&self, subject_id: &str) -> Result<Vec<PendingSyncAudit>> {
        let mut rows: Vec<_> =
            self.rows.lock().await.values().filter(|r| r.subject_id == subject_id).cloned().collect();
        newest_first(&mut rows);
        Ok(rows)
    }

    async fn find_by_document(&self, document_id: Uuid) -> Result<Option<PendingSyncAudit>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|r| r.document_id == Some(document_id))
            .cloned()
            .collect();
        newest_first(&mut rows);
        Ok(rows.into_iter().next())
    }

    async fn find_stale(
        &self,
        updated_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<PendingSyncAudit>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .await
            .values()
            .filter(|r| r.updated_at < updated_before && r.is_resendable(max_attempts))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.updated_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_by_tenant_and_status(
        &self,
        tenant_id: Uuid,
        status: AuditStatus,
    ) -> Result<u64> {
        let rows = self.rows.lock().await;
        Ok(rows.values().filter(|r| r.tenant_id == tenant_id && r.status == status).count() as u64)
    }

    async fn transition(&self, id: Uuid, event: AuditEvent) -> Result<TransitionOutcome> {
        self.check_writable()?;
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| ClinisyncError::NotFound(format!("audit row {id}")))?;
        let outcome = row.apply(&event, Utc::now());
        if let TransitionOutcome::Applied(next) = &outcome {
            *row = next.clone();
        }
        Ok(outcome)
    }
}

// ============================================================================
// Peripheral documents
// ============================================================================

#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<TokioMutex<HashMap<Uuid, LocalDocument>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, document: &LocalDocument) -> Result<()> {
        let mut documents = self.documents.lock().await;
        if let Some(stored) = documents.get(&document.id) {
            if stored.is_same_registration(document) {
                return Ok(());
            }
            return Err(ClinisyncError::Validation(format!("document {} already exists", document.id)));
        }
        documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn find(&self, document_id: Uuid) -> Result<Option<LocalDocument>> {
        Ok(self.documents.lock().await.get(&document_id).cloned())
    }

    async fn set_cross_reference(
        &self,
        document_id: Uuid,
        aggregate_id: Uuid,
    ) -> Result<CrossReferenceWrite> {
        let mut documents = self.documents.lock().await;
        let document = documents
            .get_mut(&document_id)
            .ok_or_else(|| ClinisyncError::NotFound(format!("document {document_id}")))?;
        let write = document.cross_reference().check_write(aggregate_id)?;
        document.aggregate_id = Some(aggregate_id);
        Ok(write)
    }
}

// ============================================================================
// Central registries
// ============================================================================

#[derive(Debug, Default)]
struct AggregateState {
    by_subject: HashMap<String, Uuid>,
    /// document id → (aggregate id, tenant id)
    links: HashMap<Uuid, (Uuid, Uuid)>,
    link_order: Vec<(Uuid, Uuid)>,
}

#[derive(Clone, Default)]
pub struct InMemoryAggregateRepository {
    state: Arc<TokioMutex<AggregateState>>,
    fail: Arc<AtomicBool>,
}

impl InMemoryAggregateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a transient database failure on every registration.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn link_count(&self) -> usize {
        self.state.lock().await.links.len()
    }
}

#[async_trait]
impl AggregateRepository for InMemoryAggregateRepository {
    async fn register_document(
        &self,
        request: &DocumentSyncRequest,
    ) -> Result<DocumentRegistration> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClinisyncError::Database("registry unavailable".into()));
        }
        let mut state = self.state.lock().await;

        let (aggregate_id, aggregate_created) = match state.by_subject.get(&request.subject_id) {
            Some(id) => (*id, false),
            None => (Uuid::now_v7(), true),
        };

        if let Some((linked_aggregate, linked_tenant)) = state.links.get(&request.document_id) {
            if *linked_aggregate != aggregate_id || *linked_tenant != request.tenant_id {
                return Err(ClinisyncError::Security(format!(
                    "document {} is already linked elsewhere",
                    request.document_id
                )));
            }
            return Ok(DocumentRegistration { aggregate_id, aggregate_created, newly_linked: false });
        }

        state.by_subject.insert(request.subject_id.clone(), aggregate_id);
        state.links.insert(request.document_id, (aggregate_id, request.tenant_id));
        state.link_order.push((aggregate_id, request.document_id));
        Ok(DocumentRegistration { aggregate_id, aggregate_created, newly_linked: true })
    }

    async fn find_aggregate(&self, subject_id: &str) -> Result<Option<Uuid>> {
        Ok(self.state.lock().await.by_subject.get(subject_id).copied())
    }

    async fn linked_documents(&self, aggregate_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .link_order
            .iter()
            .filter(|(aggregate, _)| *aggregate == aggregate_id)
            .map(|(_, document)| *document)
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPatientRegistry {
    patients: Arc<TokioMutex<HashMap<String, Uuid>>>,
}

impl InMemoryPatientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.patients.lock().await.len()
    }
}

#[async_trait]
impl PatientRegistry for InMemoryPatientRegistry {
    async fn register(&self, request: &UserSyncRequest) -> Result<PatientRegistration> {
        let mut patients = self.patients.lock().await;
        if let Some(patient_id) = patients.get(&request.subject_id) {
            return Ok(PatientRegistration { patient_id: *patient_id, already_registered: true });
        }
        let patient_id = Uuid::now_v7();
        patients.insert(request.subject_id.clone(), patient_id);
        Ok(PatientRegistration { patient_id, already_registered: false })
    }

    async fn find_patient(&self, subject_id: &str) -> Result<Option<Uuid>> {
        Ok(self.patients.lock().await.get(subject_id).copied())
    }
}
