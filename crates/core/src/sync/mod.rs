//! Document and patient synchronization between peripheral and central nodes.

pub mod confirmation_consumer;
pub mod confirmation_producer;
pub mod document_consumer;
pub mod document_producer;
pub mod peripheral;
pub mod ports;
pub mod reconciliation;
pub mod user_sync;

use clinisync_domain::constants::{
    MAX_ERROR_LEN, SECURITY_ERROR_PREFIX, TRANSIENT_ERROR_PREFIX, VALIDATION_ERROR_PREFIX,
};
use clinisync_domain::{ClinisyncError, FailureKind};

pub use confirmation_consumer::{ConfirmationReport, DocumentConfirmationConsumer};
pub use confirmation_producer::ConfirmationProducer;
pub use document_consumer::{DocumentSyncConsumer, ProcessingOutcome, ProcessingStage};
pub use document_producer::DocumentSyncProducer;
pub use peripheral::PeripheralSyncService;
pub use reconciliation::{ReconciliationReport, ReconciliationService};
pub use user_sync::{UserConfirmationConsumer, UserSyncConsumer, UserSyncProducer};

/// Clip error text to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut clipped: String = message.chars().take(MAX_ERROR_LEN.saturating_sub(3)).collect();
    clipped.push_str("...");
    clipped
}

/// Error text sent back to the origin in a failure confirmation.
pub(crate) fn failure_message(err: &ClinisyncError) -> String {
    let prefix = match err.failure_kind() {
        FailureKind::Validation => VALIDATION_ERROR_PREFIX,
        FailureKind::Security => SECURITY_ERROR_PREFIX,
        FailureKind::Transient | FailureKind::NotFound => TRANSIENT_ERROR_PREFIX,
    };
    truncate_error(&format!("{prefix}{}", err.detail()))
}
