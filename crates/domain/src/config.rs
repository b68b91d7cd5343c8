//! Node configuration structures.
//!
//! Every section has a `Default` so partial TOML/JSON files are accepted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    DEFAULT_MAX_DELIVERIES, DEFAULT_MAX_RESEND_ATTEMPTS, DOCUMENT_CONFIRMATION_CONCURRENCY,
    DOCUMENT_SYNC_CONCURRENCY, USER_CONFIRMATION_CONCURRENCY, USER_SYNC_CONCURRENCY,
};
use crate::errors::ClinisyncError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub workers: WorkerConfig,
    pub reconciliation: ReconciliationConfig,
    pub logging: LoggingConfig,
}

/// Which side of the protocol this process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Clinic node: produces requests, consumes confirmations.
    #[default]
    Peripheral,
    /// Aggregator: consumes requests, produces confirmations.
    Central,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Peripheral => "peripheral",
            Self::Central => "central",
        })
    }
}

impl FromStr for NodeRole {
    type Err = ClinisyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "peripheral" | "clinic" => Ok(Self::Peripheral),
            "central" => Ok(Self::Central),
            other => Err(ClinisyncError::Config(format!("unknown node role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// Consumer identity recorded on broker leases.
    pub node_id: String,
    /// Clinic tenant of a peripheral node.
    pub tenant_id: Option<Uuid>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { role: NodeRole::default(), node_id: "clinisync-node".into(), tenant_id: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "data/clinisync.db".into(), pool_size: 8, encryption_key: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Queue database shared by the peripheral and central nodes.
    pub path: String,
    pub pool_size: u32,
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
    pub max_deliveries: u32,
    pub redelivery_delay_ms: u64,
    /// How long a delivery stays invisible to other consumers.
    pub lease_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: "data/broker.db".into(),
            pool_size: 8,
            encryption_key: None,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
            redelivery_delay_ms: 1_000,
            lease_secs: 300,
        }
    }
}

/// Worker counts per queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub document_sync: usize,
    pub document_confirmation: usize,
    pub user_sync: usize,
    pub user_confirmation: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            document_sync: DOCUMENT_SYNC_CONCURRENCY,
            document_confirmation: DOCUMENT_CONFIRMATION_CONCURRENCY,
            user_sync: USER_SYNC_CONCURRENCY,
            user_confirmation: USER_CONFIRMATION_CONCURRENCY,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first).
    pub cron_expression: String,
    /// Age of the last update after which an open row is resent.
    pub stale_after_secs: u64,
    pub batch_size: usize,
    /// Rows with this many recorded failures are left for an operator.
    pub max_attempts: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron_expression: "0 */10 * * * *".into(),
            stale_after_secs: 3_600,
            batch_size: 100,
            max_attempts: DEFAULT_MAX_RESEND_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into(), json: false }
    }
}
