//! # Clinisync Core
//!
//! Pure synchronization logic - no infrastructure dependencies.
//!
//! This crate contains:
//! - Port interfaces (traits) for the broker and the stores
//! - Producers and consumers for both directions of the protocol
//! - The reconciliation pass over stale ledger rows
//!
//! ## Architecture Principles
//! - Only depends on `clinisync-domain`
//! - No database or broker code
//! - All external dependencies via traits

pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export specific items to avoid ambiguity
pub use sync::ports::{
    AggregateRepository, AuditStore, Disposition, DocumentStore, MessageBroker, MessageHandler,
    PatientRegistry,
};
pub use sync::{
    ConfirmationProducer, DocumentConfirmationConsumer, DocumentSyncConsumer,
    DocumentSyncProducer, PeripheralSyncService, ProcessingOutcome, ProcessingStage,
    ReconciliationReport, ReconciliationService, UserConfirmationConsumer, UserSyncConsumer,
    UserSyncProducer,
};
