//! Database implementations

pub mod aggregate_repository;
pub mod audit_repository;
mod codec;
pub mod document_repository;
pub mod manager;
pub mod patient_repository;

pub use aggregate_repository::SqlCipherAggregateRepository;
pub use audit_repository::SqlCipherAuditRepository;
pub use document_repository::SqlCipherDocumentRepository;
pub use manager::DbManager;
pub use patient_repository::SqlCipherPatientRepository;
