//! Error types used throughout the sync pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for clinisync
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum ClinisyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a failure is handled by a message consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or invalid input. Dropped without redelivery.
    Validation,
    /// I/O or datastore unavailability. Redelivered by the broker.
    Transient,
    /// Tenant mismatch or integrity violation. Dropped and logged at error level.
    Security,
    /// Referenced record missing. Logged and processing continues.
    NotFound,
}

impl ClinisyncError {
    /// Classify the error for consumer dispositions.
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) | Self::Config(_) => FailureKind::Validation,
            Self::Security(_) => FailureKind::Security,
            Self::NotFound(_) => FailureKind::NotFound,
            Self::Database(_) | Self::Transport(_) | Self::Conflict(_) | Self::Internal(_) => {
                FailureKind::Transient
            }
        }
    }

    /// Only transient failures are worth another delivery attempt.
    pub const fn is_retryable(&self) -> bool {
        matches!(self.failure_kind(), FailureKind::Transient)
    }

    /// Stable label for logs and metrics.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::Validation(_) => "validation",
            Self::Security(_) => "security",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// Message without the variant prefix added by `Display`.
    pub fn detail(&self) -> &str {
        match self {
            Self::Database(m)
            | Self::Config(m)
            | Self::Transport(m)
            | Self::Validation(m)
            | Self::Security(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::Internal(m) => m,
        }
    }
}

/// Result type alias for clinisync operations
pub type Result<T> = std::result::Result<T, ClinisyncError>;
