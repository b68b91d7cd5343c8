//! # Clinisync Infrastructure
//!
//! Infrastructure implementations of the core sync ports.
//!
//! This crate contains:
//! - SQLCipher repositories for the peripheral ledger and the central index
//! - The SQLCipher-backed message broker shared by both node roles
//! - The consumer pool and the reconciliation scheduler
//! - Configuration loading and in-process metrics
//!
//! ## Architecture
//! - Implements traits defined in `clinisync-core`
//! - Depends on `clinisync-common` for the encrypted connection pool
//! - Contains all "impure" code (I/O, timers, background tasks)

pub mod broker;
pub mod config;
pub mod database;
pub mod errors;
pub mod messaging;
pub mod observability;
pub mod scheduling;

// Re-export commonly used items
pub use broker::{BrokerSettings, SqlCipherBroker};
pub use database::{
    DbManager, SqlCipherAggregateRepository, SqlCipherAuditRepository,
    SqlCipherDocumentRepository, SqlCipherPatientRepository,
};
pub use errors::InfraError;
pub use messaging::{ConsumerPool, ConsumerPoolConfig, MeteredBroker, WorkerError};
pub use observability::metrics::SyncMetrics;
pub use scheduling::{ReconciliationScheduler, ReconciliationSchedulerConfig, SchedulerError};
