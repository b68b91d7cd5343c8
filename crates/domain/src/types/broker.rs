//! Broker-facing value types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::messages::SyncMessage;
use crate::constants::NORMAL_PRIORITY;
use crate::errors::{ClinisyncError, Result};

/// One logical queue per direction and entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Peripheral → central document requests.
    DocumentSync,
    /// Central → peripheral document confirmations.
    DocumentConfirmation,
    /// Peripheral → central patient registrations.
    UserSync,
    /// Central → peripheral patient confirmations.
    UserConfirmation,
}

impl QueueName {
    /// All queues, in declaration order.
    pub const ALL: [Self; 4] =
        [Self::DocumentSync, Self::DocumentConfirmation, Self::UserSync, Self::UserConfirmation];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DocumentSync => "document-sync",
            Self::DocumentConfirmation => "document-sync-confirmation",
            Self::UserSync => "user-sync",
            Self::UserConfirmation => "user-sync-confirmation",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ClinisyncError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|queue| queue.as_str() == value)
            .ok_or_else(|| ClinisyncError::Internal(format!("unknown queue '{value}'")))
    }
}

/// Broker-assigned message identifier, reused as the correlation id of replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = ClinisyncError;

    fn from_str(value: &str) -> Result<Self> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|e| ClinisyncError::Internal(format!("invalid message id '{value}': {e}")))
    }
}

/// Which messages of a queue a consumer may lease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Route {
    /// Every message on the queue.
    #[default]
    Any,
    /// Messages addressed to this tenant, plus unaddressed ones.
    Tenant(Uuid),
}

impl Route {
    /// Route for a consumer serving `tenant_id`, or every tenant when `None`.
    pub const fn for_tenant(tenant_id: Option<Uuid>) -> Self {
        match tenant_id {
            Some(tenant_id) => Self::Tenant(tenant_id),
            None => Self::Any,
        }
    }

    pub const fn tenant_id(self) -> Option<Uuid> {
        match self {
            Self::Any => None,
            Self::Tenant(tenant_id) => Some(tenant_id),
        }
    }

    /// Whether a message addressed to `address` can be leased on this route.
    pub fn accepts(self, address: Option<Uuid>) -> bool {
        match (self, address) {
            (Self::Any, _) | (Self::Tenant(_), None) => true,
            (Self::Tenant(tenant_id), Some(address)) => tenant_id == address,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Tenant(tenant_id) => write!(f, "tenant:{tenant_id}"),
        }
    }
}

/// A message ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message: SyncMessage,
    /// 0 (lowest) to 9 (highest).
    pub priority: u8,
    pub correlation_id: Option<String>,
}

impl OutboundMessage {
    /// Persistent message at normal priority.
    pub fn new(message: impl Into<SyncMessage>) -> Self {
        Self { message: message.into(), priority: NORMAL_PRIORITY, correlation_id: None }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    pub const fn queue(&self) -> QueueName {
        self.message.queue()
    }

    /// Tenant whose consumers may lease this message.
    pub const fn address(&self) -> Option<Uuid> {
        self.message.address()
    }
}

/// A message leased to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub queue: QueueName,
    /// Raw JSON, decoded by the handler so poison payloads stay observable.
    pub payload: String,
    pub priority: u8,
    pub correlation_id: Option<String>,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Identifies this lease; ack/nack with a stale token is ignored.
    pub lease_token: Uuid,
}

impl Delivery {
    pub const fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// What the broker did with a negatively acknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back on the queue, to be delivered again.
    Requeued { delivery_count: u32 },
    /// Redelivery limit reached.
    DeadLettered,
    /// The lease had already expired or been released.
    LeaseLost,
}

/// A message that exhausted its redelivery budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: MessageId,
    pub queue: QueueName,
    /// Tenant the message was addressed to, kept so a replay routes the same way.
    #[serde(default)]
    pub address: Option<Uuid>,
    pub payload: String,
    pub priority: u8,
    pub correlation_id: Option<String>,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub last_error: Option<String>,
}
