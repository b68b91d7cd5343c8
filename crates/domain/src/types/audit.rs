//! Pending synchronization ledger.
//!
//! One row per send obligation, owned by the peripheral node. Rows move
//! through a small state machine:
//!
//! ```text
//! PENDING ──► RESOLVED
//!    │           ▲
//!    ▼           │
//!  ERROR ────────┘
//!    │  ▲
//!    │  └─ repeated errors stay in ERROR
//!    ▼
//! CANCELLED
//! ```
//!
//! RESOLVED and CANCELLED are terminal. The transition rules live here so the
//! SQL and in-memory stores agree on them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::messages::{DocumentSyncRequest, SyncMessage, UserSyncRequest};
use crate::constants::{SECURITY_ERROR_PREFIX, VALIDATION_ERROR_PREFIX};
use crate::errors::{ClinisyncError, Result};

/// Lifecycle state of a [`PendingSyncAudit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Pending,
    Error,
    Resolved,
    Cancelled,
}

impl AuditStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Error => "ERROR",
            Self::Resolved => "RESOLVED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }

    /// Whether a row may move from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Resolved | Self::Error)
                | (Self::Error, Self::Resolved | Self::Cancelled | Self::Error)
        )
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = ClinisyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "ERROR" => Ok(Self::Error),
            "RESOLVED" => Ok(Self::Resolved),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(ClinisyncError::Database(format!("unknown audit status '{other}'"))),
        }
    }
}

/// What a row tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncKind {
    Document,
    User,
}

impl SyncKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "DOCUMENT",
            Self::User => "USER",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = ClinisyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "DOCUMENT" => Ok(Self::Document),
            "USER" => Ok(Self::User),
            other => Err(ClinisyncError::Database(format!("unknown sync kind '{other}'"))),
        }
    }
}

/// Input for creating a ledger row on first send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingSync {
    pub kind: SyncKind,
    pub subject_id: String,
    pub tenant_id: Uuid,
    pub document_id: Option<Uuid>,
    pub request: SyncMessage,
}

impl NewPendingSync {
    pub fn for_document(request: &DocumentSyncRequest) -> Self {
        Self {
            kind: SyncKind::Document,
            subject_id: request.subject_id.clone(),
            tenant_id: request.tenant_id,
            document_id: Some(request.document_id),
            request: SyncMessage::DocumentSyncRequest(request.clone()),
        }
    }

    /// The request is stamped with `tenant_id` so the confirmation can echo it.
    pub fn for_user(request: &UserSyncRequest, tenant_id: Uuid) -> Self {
        let request = request.clone().with_tenant(tenant_id);
        Self {
            kind: SyncKind::User,
            subject_id: request.subject_id.clone(),
            tenant_id,
            document_id: None,
            request: SyncMessage::UserSyncRequest(request),
        }
    }
}

/// Durable record of one synchronization obligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSyncAudit {
    pub id: Uuid,
    pub kind: SyncKind,
    pub subject_id: String,
    pub tenant_id: Uuid,
    pub document_id: Option<Uuid>,
    pub status: AuditStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Message to resend during reconciliation.
    pub request: SyncMessage,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutation requested on a ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// Failure confirmation received.
    Error { message: String },
    /// Success confirmation received.
    Resolve,
    /// Operator gave up on the row.
    Cancel,
    /// Reconciliation resent the request.
    Requeue,
}

impl AuditEvent {
    /// Status the event moves a row to.
    const fn target(&self, current: AuditStatus) -> AuditStatus {
        match self {
            Self::Error { .. } => AuditStatus::Error,
            Self::Resolve => AuditStatus::Resolved,
            Self::Cancel => AuditStatus::Cancelled,
            Self::Requeue => current,
        }
    }
}

/// Result of applying an [`AuditEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row changed; contains the new state.
    Applied(PendingSyncAudit),
    /// The row was already in the requested terminal state.
    Unchanged(PendingSyncAudit),
    /// The state machine forbids the move; contains the untouched row.
    Rejected { current: PendingSyncAudit, attempted: AuditStatus },
}

impl TransitionOutcome {
    pub const fn audit(&self) -> &PendingSyncAudit {
        match self {
            Self::Applied(audit) | Self::Unchanged(audit) => audit,
            Self::Rejected { current, .. } => current,
        }
    }

    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

impl PendingSyncAudit {
    /// New PENDING row.
    pub fn new(new: NewPendingSync, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind: new.kind,
            subject_id: new.subject_id,
            tenant_id: new.tenant_id,
            document_id: new.document_id,
            status: AuditStatus::Pending,
            attempt_count: 0,
            last_error: None,
            request: new.request,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub const fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether reconciliation may send the request again.
    ///
    /// Closed rows, rows at the attempt cap and rows whose last failure was
    /// a validation or security rejection stay put until an operator acts.
    pub fn is_resendable(&self, max_attempts: u32) -> bool {
        self.is_open()
            && self.attempt_count < max_attempts
            && !self.last_error.as_deref().is_some_and(is_permanent_failure)
    }

    /// Compute the row that results from `event`. Pure; persistence is the
    /// store's job.
    pub fn apply(&self, event: &AuditEvent, now: DateTime<Utc>) -> TransitionOutcome {
        let target = event.target(self.status);

        let requeue = matches!(event, AuditEvent::Requeue);
        if !requeue && self.status.is_terminal() && self.status == target {
            return TransitionOutcome::Unchanged(self.clone());
        }

        let allowed = if requeue { self.is_open() } else { self.status.can_transition_to(target) };
        if !allowed {
            return TransitionOutcome::Rejected { current: self.clone(), attempted: target };
        }

        let mut next = self.clone();
        next.status = target;
        next.updated_at = now;
        next.version = self.version.saturating_add(1);
        if let AuditEvent::Error { message } = event {
            next.attempt_count = self.attempt_count.saturating_add(1);
            next.last_error = Some(message.clone());
        }
        TransitionOutcome::Applied(next)
    }
}

/// Failure text that another send cannot fix.
pub fn is_permanent_failure(message: &str) -> bool {
    message.starts_with(VALIDATION_ERROR_PREFIX) || message.starts_with(SECURITY_ERROR_PREFIX)
}
